pub mod adapter;
pub mod sim;

pub use adapter::{DacBus, RelayBus};
pub use sim::SimulatedBus;
