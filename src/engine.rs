pub mod clock;
pub mod control_engine;

pub use clock::{RealClock, TickSource};
pub use control_engine::ControlEngine;
