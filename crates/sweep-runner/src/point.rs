use std::fmt;

/// One cell of the sweep grid. Two points with the same fields are the same
/// experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigurationPoint {
    pub payload_size: u64,
    pub validator_count: u32,
    pub threshold_percent: u32,
    pub load_duration_seconds: u64,
}

impl ConfigurationPoint {
    pub fn new(
        payload_size: u64,
        validator_count: u32,
        threshold_percent: u32,
        load_duration_seconds: u64,
    ) -> Self {
        Self {
            payload_size,
            validator_count,
            threshold_percent,
            load_duration_seconds,
        }
    }

    /// Indices of the validators taking part in this run.
    pub fn validator_indices(&self) -> impl Iterator<Item = u32> {
        0..self.validator_count
    }
}

impl fmt::Display for ConfigurationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payload={} validators={} threshold={} load_time={}s",
            self.payload_size,
            self.validator_count,
            self.threshold_percent,
            self.load_duration_seconds
        )
    }
}
