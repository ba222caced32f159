pub mod manager;

pub use manager::{Alarm, AlarmManager, AlarmName, Severity};
