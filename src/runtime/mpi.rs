//! MPI backend: one OS process per worker.
//!
//! Requires the `mpi` feature and an MPI installation. Launch with
//! `mpirun -n <P> gridrun run --mpi --config <path>`.

use mpi::collective::CommunicatorCollectives;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::{Communicator as _, SimpleCommunicator};
use mpi::traits::Root;

use super::{Communicator, InitFailure, RuntimeEndpoint};
use crate::error::{RunError, RunResult};

/// The calling process, before `MPI_Init`.
pub struct MpiEndpoint;

impl RuntimeEndpoint for MpiEndpoint {
    type Comm = MpiComm;

    fn init(self) -> Result<MpiComm, InitFailure> {
        let universe = mpi::initialize().ok_or_else(|| InitFailure {
            code: -1,
            message: "MPI could not be initialized (already initialized or unavailable)"
                .to_string(),
        })?;
        let world = universe.world();
        Ok(MpiComm {
            universe: Some(universe),
            world,
        })
    }
}

/// Worker handle on the MPI world communicator.
pub struct MpiComm {
    universe: Option<Universe>,
    world: SimpleCommunicator,
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) -> RunResult<()> {
        self.ensure_open()?;
        self.world.barrier();
        Ok(())
    }

    fn broadcast_bytes(&self, root: usize, data: Vec<u8>) -> RunResult<Vec<u8>> {
        self.ensure_open()?;
        let root_process = self.world.process_at_rank(root as i32);

        let mut len = data.len() as u64;
        root_process.broadcast_into(&mut len);

        let mut buf = if self.rank() == root {
            data
        } else {
            vec![0u8; len as usize]
        };
        root_process.broadcast_into(&mut buf[..]);
        Ok(buf)
    }

    fn all_gather_bytes(&self, data: Vec<u8>) -> RunResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let len = data.len() as i32;
        let mut counts = vec![0i32; self.size()];
        self.world.all_gather_into(&len, &mut counts[..]);

        let displs: Vec<i32> = counts
            .iter()
            .scan(0i32, |acc, &count| {
                let start = *acc;
                *acc += count;
                Some(start)
            })
            .collect();
        let total: i32 = counts.iter().sum();

        let mut buf = vec![0u8; total as usize];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            self.world.all_gather_varcount_into(&data[..], &mut partition);
        }

        Ok(counts
            .iter()
            .zip(&displs)
            .map(|(&count, &start)| buf[start as usize..(start + count) as usize].to_vec())
            .collect())
    }

    fn finalize(&mut self) -> RunResult<()> {
        // Dropping the universe calls MPI_Finalize.
        match self.universe.take() {
            Some(universe) => {
                drop(universe);
                Ok(())
            }
            None => Err(RunError::Collective("MPI already finalized".to_string())),
        }
    }
}

impl MpiComm {
    fn ensure_open(&self) -> RunResult<()> {
        if self.universe.is_none() {
            return Err(RunError::Collective("MPI already finalized".to_string()));
        }
        Ok(())
    }
}
