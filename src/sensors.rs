pub mod cache;

pub use cache::{SensorCache, SensorReading, SensorSource};
