//! In-process process group: one blocking thread per worker.
//!
//! All collectives are built on a single generation-counted rendezvous in
//! which every rank deposits a buffer and, once the last rank arrives,
//! every rank reads the full set.

use std::panic;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{Communicator, InitFailure, RuntimeEndpoint};
use crate::error::{RunError, RunResult};

#[derive(Default)]
struct RoundState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Vec<u8>>>,
    /// Set when a worker died mid-run; later collectives fail instead of hanging.
    poisoned: Option<String>,
}

struct Rendezvous {
    size: usize,
    state: Mutex<RoundState>,
    ready: Condvar,
}

impl Rendezvous {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(RoundState {
                slots: vec![None; size],
                ..Default::default()
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> RunResult<MutexGuard<'_, RoundState>> {
        self.state
            .lock()
            .map_err(|_| RunError::Collective("local group state poisoned".to_string()))
    }

    fn exchange(&self, rank: usize, data: Vec<u8>) -> RunResult<Arc<Vec<Vec<u8>>>> {
        let mut state = self.lock()?;
        if let Some(reason) = &state.poisoned {
            return Err(RunError::Collective(reason.clone()));
        }

        let generation = state.generation;
        state.slots[rank] = Some(data);
        state.arrived += 1;

        if state.arrived == self.size {
            let round: Vec<Vec<u8>> = state
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            state.published = Arc::new(round);
            state.arrived = 0;
            state.generation += 1;
            self.ready.notify_all();
            return Ok(state.published.clone());
        }

        while state.generation == generation {
            if let Some(reason) = &state.poisoned {
                return Err(RunError::Collective(reason.clone()));
            }
            state = self
                .ready
                .wait(state)
                .map_err(|_| RunError::Collective("local group state poisoned".to_string()))?;
        }

        Ok(state.published.clone())
    }

    fn poison(&self, reason: String) {
        if let Ok(mut state) = self.state.lock() {
            state.poisoned.get_or_insert(reason);
        }
        self.ready.notify_all();
    }
}

/// A group of in-process workers sharing one rendezvous.
pub struct LocalGroup {
    size: usize,
    init_failure: Option<InitFailure>,
    finalize_failure: Option<String>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            init_failure: None,
            finalize_failure: None,
        }
    }

    /// A group whose runtime refuses to start, as when the launcher is broken.
    pub fn failing_init(size: usize, failure: InitFailure) -> Self {
        Self {
            size,
            init_failure: Some(failure),
            finalize_failure: None,
        }
    }

    /// A group whose runtime reports an error when it is torn down.
    pub fn failing_finalize(size: usize, message: &str) -> Self {
        Self {
            size,
            init_failure: None,
            finalize_failure: Some(message.to_string()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn endpoints(self) -> Vec<LocalEndpoint> {
        let rendezvous = Arc::new(Rendezvous::new(self.size));
        (0..self.size)
            .map(|rank| LocalEndpoint {
                rank,
                rendezvous: rendezvous.clone(),
                init_failure: self.init_failure.clone(),
                finalize_failure: self.finalize_failure.clone(),
            })
            .collect()
    }

    /// Run `worker` once per rank on blocking threads and collect the
    /// results in rank order. A panicking worker is re-raised here.
    pub async fn launch<F, R>(self, worker: F) -> Vec<R>
    where
        F: Fn(LocalEndpoint) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let worker = Arc::new(worker);
        let handles: Vec<_> = self
            .endpoints()
            .into_iter()
            .map(|endpoint| {
                let worker = worker.clone();
                tokio::task::spawn_blocking(move || worker(endpoint))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
                Err(e) => panic::panic_any(format!("local worker task failed: {}", e)),
            }
        }
        results
    }

    /// Launch with already-initialized communicators.
    #[cfg(test)]
    pub(crate) async fn run<F, R>(size: usize, worker: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        Self::new(size)
            .launch(move |endpoint| worker(endpoint.init().unwrap()))
            .await
    }
}

/// Unconnected slot in a [`LocalGroup`].
pub struct LocalEndpoint {
    rank: usize,
    rendezvous: Arc<Rendezvous>,
    init_failure: Option<InitFailure>,
    finalize_failure: Option<String>,
}

impl RuntimeEndpoint for LocalEndpoint {
    type Comm = LocalComm;

    fn init(self) -> Result<LocalComm, InitFailure> {
        if let Some(failure) = self.init_failure {
            return Err(failure);
        }
        Ok(LocalComm {
            rank: self.rank,
            rendezvous: self.rendezvous,
            finalized: false,
            finalize_failure: self.finalize_failure,
        })
    }
}

/// Worker handle on an in-process group.
pub struct LocalComm {
    rank: usize,
    rendezvous: Arc<Rendezvous>,
    finalized: bool,
    finalize_failure: Option<String>,
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.rendezvous.size
    }

    fn barrier(&self) -> RunResult<()> {
        self.rendezvous.exchange(self.rank, Vec::new()).map(|_| ())
    }

    fn broadcast_bytes(&self, root: usize, data: Vec<u8>) -> RunResult<Vec<u8>> {
        if root >= self.size() {
            return Err(RunError::Collective(format!("broadcast root {} out of range", root)));
        }
        let payload = if self.rank == root { data } else { Vec::new() };
        let round = self.rendezvous.exchange(self.rank, payload)?;
        Ok(round[root].clone())
    }

    fn all_gather_bytes(&self, data: Vec<u8>) -> RunResult<Vec<Vec<u8>>> {
        let round = self.rendezvous.exchange(self.rank, data)?;
        Ok(round.as_ref().clone())
    }

    fn finalize(&mut self) -> RunResult<()> {
        if self.finalized {
            return Err(RunError::Collective("process group already finalized".to_string()));
        }
        self.barrier()?;
        self.finalized = true;
        match &self.finalize_failure {
            Some(message) => Err(RunError::Collective(message.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.rendezvous
                .poison(format!("worker {} panicked", self.rank));
        }
    }
}
