pub mod climate_mode;
pub mod hysteresis;
pub mod interlock;
pub mod photoperiod;
pub mod pid;
pub mod pwm;
pub mod rules;
pub mod schedule;
