mod resolver;
mod types;

pub use resolver::{next_occurrence, slot_instant};
pub use types::{
    CycleRule, DurationPolicy, Frequency, RecurrenceError, RecurrenceRule, TimeSlot,
};

#[cfg(test)]
mod tests;
