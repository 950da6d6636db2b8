use anyhow::bail;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::time::TimeRecord;

/// When to persist full state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    None,
    /// After the last timestep only.
    EndOfRun,
    /// At timesteps `0, every, 2*every, ...`.
    Interval { every: usize },
    /// Whenever a timestep ends exactly at one of the listed instants.
    Dates { at: Vec<NaiveDateTime> },
}

impl CheckpointPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            Self::Interval { every: 0 } => bail!("checkpoint interval must be at least 1"),
            Self::Dates { at } if at.is_empty() => bail!("checkpoint dates list is empty"),
            _ => Ok(()),
        }
    }
}

/// Whether state is dumped after `record` completes.
///
/// Depends only on broadcast configuration and the shared calendar, so
/// every worker reaches the same answer without communicating.
pub fn should_checkpoint(policy: &CheckpointPolicy, record: &TimeRecord, nrecs: usize) -> bool {
    match policy {
        CheckpointPolicy::None => false,
        CheckpointPolicy::EndOfRun => record.index + 1 == nrecs,
        CheckpointPolicy::Interval { every } => record.index % every == 0,
        CheckpointPolicy::Dates { at } => {
            let end = record.end();
            at.iter().any(|instant| *instant == end)
        }
    }
}
