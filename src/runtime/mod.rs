//! Process-group binding and collective primitives.
//!
//! Every collective blocks until all workers of the group reach the same
//! call. Callers must make identical sequences of calls on every rank;
//! [`agree`] turns a per-worker failure into a group-wide one so that no
//! worker is left waiting inside the next collective.

mod local;
#[cfg(feature = "mpi")]
mod mpi;

pub use local::{LocalComm, LocalEndpoint, LocalGroup};
#[cfg(feature = "mpi")]
pub use self::mpi::{MpiComm, MpiEndpoint};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::error::{RunError, RunResult};

/// Rank that parses configuration and reports setup errors.
pub const COORDINATOR: usize = 0;

/// Parallel runtime failed to start. Reported on stderr only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFailure {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parallel runtime error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for InitFailure {}

/// An unconnected worker slot; `init` joins the process group.
pub trait RuntimeEndpoint {
    type Comm: Communicator;

    fn init(self) -> Result<Self::Comm, InitFailure>;
}

/// Collective operations over a fixed group of workers.
pub trait Communicator {
    /// This worker's rank in `[0, size)`.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    fn barrier(&self) -> RunResult<()>;

    /// Copy `root`'s bytes to every worker. Non-root input is ignored.
    fn broadcast_bytes(&self, root: usize, data: Vec<u8>) -> RunResult<Vec<u8>>;

    /// Every worker receives every worker's bytes, in rank order.
    fn all_gather_bytes(&self, data: Vec<u8>) -> RunResult<Vec<Vec<u8>>>;

    /// `root` receives every worker's bytes in rank order; others get `None`.
    fn gather_bytes(&self, root: usize, data: Vec<u8>) -> RunResult<Option<Vec<Vec<u8>>>> {
        let all = self.all_gather_bytes(data)?;
        Ok((self.rank() == root).then_some(all))
    }

    /// Rank `r` receives `chunks[r]` from `root`.
    ///
    /// The root always enters the broadcast; a bad `chunks` argument is
    /// carried in the payload so every worker fails together.
    fn scatter_bytes(&self, root: usize, chunks: Option<Vec<Vec<u8>>>) -> RunResult<Vec<u8>> {
        let payload = if self.rank() == root {
            let sent: Result<Vec<Vec<u8>>, String> = match chunks {
                None => Err("scatter root supplied no chunks".to_string()),
                Some(chunks) if chunks.len() != self.size() => Err(format!(
                    "scatter root supplied {} chunks for {} workers",
                    chunks.len(),
                    self.size()
                )),
                Some(chunks) => Ok(chunks),
            };
            encode(&sent)?
        } else {
            Vec::new()
        };
        let received: Result<Vec<Vec<u8>>, String> = decode(&self.broadcast_bytes(root, payload)?)?;
        received
            .map_err(RunError::Collective)?
            .into_iter()
            .nth(self.rank())
            .ok_or_else(|| RunError::Collective("scatter payload missing this rank".to_string()))
    }

    /// Logical AND of every worker's flag.
    fn all_reduce_and(&self, value: bool) -> RunResult<bool> {
        let flags = self.all_gather_bytes(vec![value as u8])?;
        Ok(flags.iter().all(|f| f.first() == Some(&1)))
    }

    /// Leave the process group. Collective.
    fn finalize(&mut self) -> RunResult<()>;
}

fn encode<T: Serialize + ?Sized>(value: &T) -> RunResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RunError::Collective(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RunResult<T> {
    serde_json::from_slice(bytes).map_err(|e| RunError::Collective(format!("decode: {}", e)))
}

/// Broadcast a value from `root`. `value` must be `Some` on `root`; if it
/// is not, every worker returns an error.
pub fn broadcast_value<C, T>(comm: &C, root: usize, value: Option<&T>) -> RunResult<T>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let payload = if comm.rank() == root {
        let sent = value.ok_or_else(|| "broadcast root supplied no value".to_string());
        encode(&sent).or_else(|e| encode(&Err::<&T, String>(e.to_string())))?
    } else {
        Vec::new()
    };
    let received: Result<T, String> = decode(&comm.broadcast_bytes(root, payload)?)?;
    received.map_err(|msg| RunError::Collective(format!("broadcast from worker {}: {}", root, msg)))
}

/// Gather one value per worker to `root`, in rank order.
pub fn gather_value<C, T>(comm: &C, root: usize, value: &T) -> RunResult<Option<Vec<T>>>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    match comm.gather_bytes(root, encode(value)?)? {
        Some(parts) => parts.iter().map(|p| decode(p)).collect::<RunResult<Vec<T>>>().map(Some),
        None => Ok(None),
    }
}

/// Scatter `values[r]` from `root` to rank `r`.
pub fn scatter_value<C, T>(comm: &C, root: usize, values: Option<Vec<T>>) -> RunResult<T>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let encoded = values
        .map(|values| values.iter().map(|v| encode(v)).collect::<RunResult<Vec<_>>>())
        .transpose();
    match encoded {
        Ok(chunks) => decode(&comm.scatter_bytes(root, chunks)?),
        Err(e) => {
            // Keep the other workers in step before reporting.
            let _ = comm.scatter_bytes(root, None);
            Err(e)
        }
    }
}

/// Collective error check for a phase that can fail independently per worker.
///
/// Every worker contributes whether its `result` is `Ok`. If any worker
/// failed, all workers return an error: the failing ones keep their own,
/// the rest get [`RunError::PeerAborted`] naming the failed ranks.
pub fn agree<C, T>(comm: &C, phase: &str, result: RunResult<T>) -> RunResult<T>
where
    C: Communicator + ?Sized,
{
    let flags = comm.all_gather_bytes(vec![result.is_ok() as u8])?;
    let failed: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter(|(_, flag)| flag.first() != Some(&1))
        .map(|(rank, _)| rank)
        .collect();

    match result {
        Err(e) => Err(e),
        Ok(value) if failed.is_empty() => Ok(value),
        Ok(_) => Err(RunError::PeerAborted {
            phase: phase.to_string(),
            ranks: failed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_agree_propagates_single_failure() {
        let results = LocalGroup::run(4, |comm| {
            let local = if comm.rank() == 2 {
                Err(RunError::Configuration("missing file".into()))
            } else {
                Ok(comm.rank())
            };
            agree(&comm, "load", local)
        })
        .await;

        assert_eq!(results.len(), 4);
        for (rank, result) in results.into_iter().enumerate() {
            match result {
                Err(RunError::Configuration(_)) => assert_eq!(rank, 2),
                Err(RunError::PeerAborted { phase, ranks }) => {
                    assert_ne!(rank, 2);
                    assert_eq!(phase, "load");
                    assert_eq!(ranks, vec![2]);
                }
                other => panic!("rank {} unexpectedly got {:?}", rank, other),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_root_without_data_fails_every_worker() {
        let results = tokio::time::timeout(
            Duration::from_secs(10),
            LocalGroup::run(3, |comm| {
                let missing: RunResult<String> = broadcast_value(&comm, COORDINATOR, None);
                let short = comm.scatter_bytes(
                    COORDINATOR,
                    (comm.rank() == COORDINATOR).then(|| vec![vec![1u8], vec![2u8]]),
                );
                let next = comm.all_gather_bytes(vec![comm.rank() as u8]);
                (missing.is_err(), short.is_err(), next.is_ok())
            }),
        )
        .await
        .expect("collectives hung");

        assert_eq!(results, vec![(true, true, true); 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_typed_collectives() {
        let results = LocalGroup::run(3, |comm| {
            let rank = comm.rank();
            let word: String = broadcast_value(&comm, COORDINATOR, (rank == 0).then(|| "hello".to_string()).as_ref())?;
            let gathered = gather_value(&comm, COORDINATOR, &(rank * 10))?;
            let mine: usize = scatter_value(&comm, COORDINATOR, (rank == 0).then(|| vec![7, 8, 9]))?;
            let all_true = comm.all_reduce_and(true)?;
            let not_all = comm.all_reduce_and(rank != 1)?;
            Ok::<_, RunError>((word, gathered, mine, all_true, not_all))
        })
        .await;

        for (rank, result) in results.into_iter().enumerate() {
            let (word, gathered, mine, all_true, not_all) = result.unwrap();
            assert_eq!(word, "hello");
            assert_eq!(mine, 7 + rank);
            assert!(all_true);
            assert!(!not_all);
            if rank == 0 {
                assert_eq!(gathered, Some(vec![0, 10, 20]));
            } else {
                assert_eq!(gathered, None);
            }
        }
    }
}
