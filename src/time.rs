//! Pre-computed calendar sequence for the run.

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SECONDS_PER_DAY: u32 = 86_400;

/// One timestep's position in the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRecord {
    /// Zero-based record index within the run.
    pub index: usize,
    /// Start of the timestep.
    pub start: NaiveDateTime,
    /// Length of the timestep in seconds.
    pub step_seconds: u32,
}

impl TimeRecord {
    /// Instant the timestep ends (and state after the step is valid).
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::seconds(self.step_seconds as i64)
    }

    /// Seconds since midnight at the start of the timestep.
    pub fn dayseconds(&self) -> u32 {
        self.start.num_seconds_from_midnight()
    }

    pub fn year(&self) -> i32 {
        self.start.year()
    }

    pub fn month(&self) -> u32 {
        self.start.month()
    }

    pub fn day(&self) -> u32 {
        self.start.day()
    }

    /// File stem fragment `YYYYMMDD_sssss` for the start of the timestep.
    pub fn start_stamp(&self) -> String {
        stamp(self.start)
    }

    /// File stem fragment `YYYYMMDD_sssss` for the end of the timestep.
    pub fn end_stamp(&self) -> String {
        stamp(self.end())
    }
}

fn stamp(at: NaiveDateTime) -> String {
    format!(
        "{:04}{:02}{:02}_{:05}",
        at.year(),
        at.month(),
        at.day(),
        at.num_seconds_from_midnight()
    )
}

impl fmt::Display for TimeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:04}-{:02}-{:02} {:05}s",
            self.index,
            self.year(),
            self.month(),
            self.day(),
            self.dayseconds()
        )
    }
}

/// Build the ordered record sequence covering the whole run.
pub fn build_time_records(start: NaiveDateTime, step_seconds: u32, nrecs: usize) -> Vec<TimeRecord> {
    let step = Duration::seconds(step_seconds as i64);
    let mut records = Vec::with_capacity(nrecs);
    let mut current = start;
    for index in 0..nrecs {
        records.push(TimeRecord {
            index,
            start: current,
            step_seconds,
        });
        current += step;
    }
    records
}
