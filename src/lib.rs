// Core modules
pub mod config;
pub mod error;
pub mod time;

// Parallel runtime and partitioning
pub mod domain;
pub mod runtime;

// Run lifecycle
pub mod checkpoint;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod routing;

// Re-export key types and functions
pub use checkpoint::{CheckpointManifest, CheckpointPolicy, read_manifest, should_checkpoint};
pub use config::{GlobalParameters, resolve_config_path};
pub use domain::{Decomposition, DecompositionStrategy, GlobalDomain, LocalDomain};
pub use error::{EXIT_FAILURE, EXIT_STARTUP_FAILURE, EXIT_SUCCESS, RunError, RunResult};
pub use model::{CollaboratorFactory, Collaborators};
pub use orchestrator::{
    Orchestrator, Phase, RunContext, RunSummary, WorkerOutcome, exit_status, run_local,
    start_worker,
};
pub use runtime::{Communicator, InitFailure, LocalGroup, RuntimeEndpoint};
pub use time::TimeRecord;

#[cfg(feature = "mpi")]
pub use runtime::{MpiComm, MpiEndpoint};
