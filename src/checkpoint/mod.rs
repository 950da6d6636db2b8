//! Checkpoint timing and the collective state dump.

mod policy;
mod store;

pub use policy::{CheckpointPolicy, should_checkpoint};
pub use store::{
    CHECKPOINT_VERSION, CheckpointManifest, CheckpointTarget, RankEntry, RestoreExpectation,
    read_manifest, restore_local, write_checkpoint,
};
