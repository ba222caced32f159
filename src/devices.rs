pub mod relay_manager;

pub use relay_manager::{DeviceState, RelayManager, Transition};
