//! On-disk checkpoint layout.
//!
//! ```text
//! <dir>/<prefix>.<YYYYMMDD>_<sssss>.rank0000.bin   bincode, one per worker
//! <dir>/<prefix>.<YYYYMMDD>_<sssss>.rank0001.bin
//! <dir>/<prefix>.<YYYYMMDD>_<sssss>.json           manifest, written last
//! ```
//!
//! A checkpoint exists only once its manifest exists. Rank files are
//! written to `.part` names and renamed after every worker reports
//! success, so an aborted dump never leaves a loadable checkpoint.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::LocalDomain;
use crate::error::{RunError, RunResult};
use crate::model::CellState;
use crate::runtime::{COORDINATOR, Communicator, agree, gather_value};
use crate::time::TimeRecord;

/// Checkpoint format version (increment on breaking changes).
pub const CHECKPOINT_VERSION: u32 = 1;

/// Per-worker entry in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: usize,
    /// File name relative to the manifest's directory.
    pub file: String,
    pub ncells: usize,
    pub sha256: String,
}

/// Metadata describing one complete checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub run_id: Uuid,
    /// Timestep whose completed state is stored.
    pub timestep: usize,
    /// End of that timestep.
    pub valid_at: NaiveDateTime,
    pub created_at: DateTime<Utc>,
    pub size: usize,
    pub ncells: usize,
    pub fingerprint: String,
    pub state_variables: Vec<String>,
    pub ranks: Vec<RankEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RankPayload {
    version: u32,
    timestep: usize,
    rank: usize,
    fingerprint: String,
    cells: Vec<CellState>,
}

/// Where and how this run writes checkpoints. Identical on every worker.
#[derive(Debug, Clone)]
pub struct CheckpointTarget {
    pub directory: PathBuf,
    pub prefix: String,
    pub run_id: Uuid,
    pub fingerprint: String,
    pub ncells: usize,
    pub state_variables: Vec<String>,
}

impl CheckpointTarget {
    pub fn manifest_path(&self, record: &TimeRecord) -> PathBuf {
        self.directory
            .join(format!("{}.{}.json", self.prefix, record.end_stamp()))
    }

    fn rank_file_name(&self, record: &TimeRecord, rank: usize) -> String {
        format!("{}.{}.rank{:04}.bin", self.prefix, record.end_stamp(), rank)
    }
}

/// Collectively dump every worker's state for `record`.
///
/// Either all workers commit their portion and the coordinator writes the
/// manifest, or every worker returns [`RunError::Checkpoint`].
pub fn write_checkpoint<C>(
    comm: &C,
    target: &CheckpointTarget,
    record: &TimeRecord,
    local: &LocalDomain,
    state: &[CellState],
) -> RunResult<PathBuf>
where
    C: Communicator + ?Sized,
{
    let timestep = record.index;
    let failed = |e: RunError| match e {
        RunError::Checkpoint { .. } => e,
        other => RunError::Checkpoint {
            timestep,
            message: other.to_string(),
        },
    };

    let file = target.rank_file_name(record, comm.rank());
    let final_path = target.directory.join(&file);
    let part_path = target.directory.join(format!("{}.part", file));

    let written = write_rank_file(target, record, comm.rank(), local, state, &part_path);
    let sha256 = match agree(comm, "checkpoint-write", written) {
        Ok(sha) => sha,
        Err(e) => {
            remove_quietly(&part_path);
            return Err(failed(e));
        }
    };

    let committed = fs::rename(&part_path, &final_path).map_err(|e| {
        RunError::Checkpoint {
            timestep,
            message: format!("renaming {}: {}", part_path.display(), e),
        }
    });
    if let Err(e) = agree(comm, "checkpoint-commit", committed) {
        remove_quietly(&part_path);
        remove_quietly(&final_path);
        return Err(failed(e));
    }

    let entry = RankEntry {
        rank: comm.rank(),
        file,
        ncells: state.len(),
        sha256,
    };
    let entries = gather_value(comm, COORDINATOR, &entry).map_err(failed)?;

    let manifest_path = target.manifest_path(record);
    let manifest_written = match entries {
        Some(ranks) => {
            let manifest = CheckpointManifest {
                version: CHECKPOINT_VERSION,
                run_id: target.run_id,
                timestep,
                valid_at: record.end(),
                created_at: Utc::now(),
                size: comm.size(),
                ncells: target.ncells,
                fingerprint: target.fingerprint.clone(),
                state_variables: target.state_variables.clone(),
                ranks,
            };
            write_manifest(&manifest_path, &manifest)
        }
        None => Ok(()),
    };
    agree(comm, "checkpoint-manifest", manifest_written).map_err(failed)?;

    if comm.rank() == COORDINATOR {
        info!("finished storing state file: {}", manifest_path.display());
    }
    Ok(manifest_path)
}

fn write_rank_file(
    target: &CheckpointTarget,
    record: &TimeRecord,
    rank: usize,
    local: &LocalDomain,
    state: &[CellState],
    path: &Path,
) -> RunResult<String> {
    let timestep = record.index;
    let io_err = |what: &str, e: &dyn std::fmt::Display| RunError::Checkpoint {
        timestep,
        message: format!("{} {}: {}", what, path.display(), e),
    };

    if state.len() != local.ncells() {
        return Err(RunError::Checkpoint {
            timestep,
            message: format!("state has {} cells, local domain {}", state.len(), local.ncells()),
        });
    }

    let payload = RankPayload {
        version: CHECKPOINT_VERSION,
        timestep,
        rank,
        fingerprint: target.fingerprint.clone(),
        cells: state.to_vec(),
    };
    let bytes = bincode::serialize(&payload).map_err(|e| io_err("encoding", &e))?;

    fs::create_dir_all(&target.directory).map_err(|e| io_err("creating directory for", &e))?;
    fs::write(path, &bytes).map_err(|e| io_err("writing", &e))?;
    debug!("wrote {} bytes of state to {}", bytes.len(), path.display());

    Ok(sha256_hex(&bytes))
}

fn write_manifest(path: &Path, manifest: &CheckpointManifest) -> RunResult<()> {
    let timestep = manifest.timestep;
    let fail = |e: &dyn std::fmt::Display| RunError::Checkpoint {
        timestep,
        message: format!("writing manifest {}: {}", path.display(), e),
    };
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| fail(&e))?;
    let tmp = path.with_extension("json.part");
    fs::write(&tmp, json).map_err(|e| fail(&e))?;
    fs::rename(&tmp, path).map_err(|e| fail(&e))
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("could not remove {}: {}", path.display(), e);
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Read a checkpoint manifest.
pub fn read_manifest(path: &Path) -> RunResult<CheckpointManifest> {
    let raw = fs::read(path)
        .map_err(|e| RunError::Restart(format!("reading manifest {}: {}", path.display(), e)))?;
    let manifest: CheckpointManifest = serde_json::from_slice(&raw)
        .map_err(|e| RunError::Restart(format!("parsing manifest {}: {}", path.display(), e)))?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(RunError::Restart(format!(
            "checkpoint version mismatch: expected {}, found {}",
            CHECKPOINT_VERSION, manifest.version
        )));
    }
    Ok(manifest)
}

/// What the current run requires of a checkpoint it restarts from.
#[derive(Debug, Clone)]
pub struct RestoreExpectation<'a> {
    pub size: usize,
    pub ncells: usize,
    pub fingerprint: &'a str,
    pub state_variables: &'a [String],
}

/// Load this worker's portion of a checkpoint, validating it against the
/// current partition.
pub fn restore_local(
    manifest_path: &Path,
    expect: &RestoreExpectation<'_>,
    local: &LocalDomain,
) -> RunResult<(CheckpointManifest, Vec<CellState>)> {
    let manifest = read_manifest(manifest_path)?;

    if manifest.size != expect.size {
        return Err(RunError::Restart(format!(
            "checkpoint was written by {} workers, this run has {}",
            manifest.size, expect.size
        )));
    }
    if manifest.ncells != expect.ncells {
        return Err(RunError::Restart(format!(
            "checkpoint covers {} cells, domain has {}",
            manifest.ncells, expect.ncells
        )));
    }
    if manifest.fingerprint != expect.fingerprint {
        return Err(RunError::Restart(
            "checkpoint partition layout does not match this run's decomposition".to_string(),
        ));
    }
    if manifest.state_variables != expect.state_variables {
        return Err(RunError::Restart(format!(
            "checkpoint state variables {:?} differ from configured {:?}",
            manifest.state_variables, expect.state_variables
        )));
    }

    let entry = manifest
        .ranks
        .iter()
        .find(|e| e.rank == local.rank)
        .ok_or_else(|| RunError::Restart(format!("manifest has no entry for worker {}", local.rank)))?;

    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let path = dir.join(&entry.file);
    let bytes = fs::read(&path)
        .map_err(|e| RunError::Restart(format!("reading {}: {}", path.display(), e)))?;
    if sha256_hex(&bytes) != entry.sha256 {
        return Err(RunError::Restart(format!("checksum mismatch in {}", path.display())));
    }

    let payload: RankPayload = bincode::deserialize(&bytes)
        .map_err(|e| RunError::Restart(format!("decoding {}: {}", path.display(), e)))?;
    if payload.rank != local.rank || payload.fingerprint != manifest.fingerprint {
        return Err(RunError::Restart(format!(
            "{} belongs to a different worker or partition",
            path.display()
        )));
    }

    let cells: Vec<usize> = payload.cells.iter().map(|c| c.cell).collect();
    if cells != local.cells {
        return Err(RunError::Restart(format!(
            "worker {} cell ownership in checkpoint differs from current partition",
            local.rank
        )));
    }
    if let Some(bad) = payload
        .cells
        .iter()
        .find(|c| c.values.len() != expect.state_variables.len())
    {
        return Err(RunError::Restart(format!(
            "cell {} has {} state values, expected {}",
            bad.cell,
            bad.values.len(),
            expect.state_variables.len()
        )));
    }

    Ok((manifest, payload.cells))
}
