//! Scheduling: when broadcast runs fire.

mod calendar;
mod trigger;

pub use calendar::{daily_fires_between, next_daily_fire, Schedule, TimeOfDay};
pub use trigger::{Job, Trigger, TriggerConfig};
