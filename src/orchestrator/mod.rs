//! Lifecycle state machine driving one worker through a run.
//!
//! Every worker steps through the same phases in the same order. Each
//! phase that can fail on a single worker ends in [`agree`], so a local
//! failure becomes a group-wide abort at a known point instead of a hang
//! in the next collective.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointTarget, should_checkpoint, write_checkpoint};
use crate::config::{GlobalParameters, resolve_config_path};
use crate::domain::{Decomposition, GlobalDomain, LocalDomain};
use crate::error::{EXIT_FAILURE, EXIT_STARTUP_FAILURE, EXIT_SUCCESS, RunError, RunResult};
use crate::model::{
    CellParameters, CellState, CollaboratorFactory, Collaborators, InitialState, StateSetup,
};
use crate::runtime::{
    COORDINATOR, Communicator, LocalGroup, RuntimeEndpoint, agree, broadcast_value,
};
use crate::time::TimeRecord;


/// Lifecycle phases, in the only order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Configured,
    Allocated,
    Initialized,
    Running { timestep: usize },
    Finalizing,
    Done,
}

/// Everything a worker holds for the run. Built once at `Configured`.
pub struct RunContext {
    pub run_id: Uuid,
    pub params: GlobalParameters,
    pub domain: GlobalDomain,
    pub decomposition: Decomposition,
    pub local: LocalDomain,
    pub records: Vec<TimeRecord>,
    pub cell_params: Vec<CellParameters>,
    pub state: Vec<CellState>,
    /// First timestep this run executes; nonzero after a restart.
    pub first_timestep: usize,
    collaborators: Collaborators,
    checkpoint: CheckpointTarget,
}

/// What one worker did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub rank: usize,
    pub size: usize,
    pub run_id: Uuid,
    pub first_timestep: usize,
    pub timesteps_run: usize,
    pub checkpoints: Vec<PathBuf>,
    pub final_state: Vec<CellState>,
}

pub struct Orchestrator<'a, C: Communicator> {
    comm: &'a C,
    factory: &'a dyn CollaboratorFactory,
    config_path: Option<PathBuf>,
    phase: Phase,
    ctx: Option<RunContext>,
    timesteps_run: usize,
    checkpoints: Vec<PathBuf>,
}

fn running_or_finalizing(timestep: usize, nrecs: usize) -> Phase {
    if timestep < nrecs {
        Phase::Running { timestep }
    } else {
        Phase::Finalizing
    }
}

fn context(ctx: &mut Option<RunContext>) -> RunResult<&mut RunContext> {
    ctx.as_mut().ok_or_else(|| RunError::Runtime {
        timestep: None,
        message: "run context used before configuration".to_string(),
    })
}

impl<'a, C: Communicator> Orchestrator<'a, C> {
    /// `config_path` is only consulted on the coordinator.
    pub fn new(
        comm: &'a C,
        config_path: Option<PathBuf>,
        factory: &'a dyn CollaboratorFactory,
    ) -> Self {
        Self {
            comm,
            factory,
            config_path,
            phase: Phase::Starting,
            ctx: None,
            timesteps_run: 0,
            checkpoints: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn context(&self) -> Option<&RunContext> {
        self.ctx.as_ref()
    }

    /// Perform exactly one transition and return the new phase.
    ///
    /// An error leaves the phase unchanged; every other worker of the
    /// group has returned an error from the same step.
    pub fn step(&mut self) -> RunResult<Phase> {
        let next = match self.phase {
            Phase::Starting => self.configure()?,
            Phase::Configured => self.allocate()?,
            Phase::Allocated => self.initialize()?,
            Phase::Initialized => {
                let ctx = context(&mut self.ctx)?;
                running_or_finalizing(ctx.first_timestep, ctx.records.len())
            }
            Phase::Running { timestep } => self.timestep(timestep)?,
            Phase::Finalizing => self.finalize()?,
            Phase::Done => Phase::Done,
        };
        debug!("{:?} -> {:?}", self.phase, next);
        self.phase = next;
        Ok(next)
    }

    /// Step until `Done`.
    pub fn run(mut self) -> RunResult<RunSummary> {
        while self.phase != Phase::Done {
            self.step()?;
        }
        let ctx = context(&mut self.ctx)?;
        Ok(RunSummary {
            rank: self.comm.rank(),
            size: self.comm.size(),
            run_id: ctx.run_id,
            first_timestep: ctx.first_timestep,
            timesteps_run: self.timesteps_run,
            checkpoints: std::mem::take(&mut self.checkpoints),
            final_state: std::mem::take(&mut ctx.state),
        })
    }

    fn read_parameters(&self) -> Result<(GlobalParameters, Uuid), String> {
        let path = resolve_config_path(self.config_path.clone()).map_err(|e| format!("{:#}", e))?;
        info!("reading global parameters from {}", path.display());
        let params = GlobalParameters::from_file(&path).map_err(|e| format!("{:#}", e))?;
        Ok((params, Uuid::new_v4()))
    }

    /// Coordinator parses, everyone receives the same parameters, then
    /// every worker derives the identical partition.
    fn configure(&mut self) -> RunResult<Phase> {
        let comm = self.comm;
        let rank = comm.rank();

        let parsed = (rank == COORDINATOR).then(|| self.read_parameters());
        let received: Result<(GlobalParameters, Uuid), String> =
            broadcast_value(comm, COORDINATOR, parsed.as_ref())?;
        let (params, run_id) = match received {
            Ok(v) => v,
            Err(msg) if rank == COORDINATOR => return Err(RunError::Configuration(msg)),
            Err(_) => {
                return Err(RunError::PeerAborted {
                    phase: "configure".to_string(),
                    ranks: vec![COORDINATOR],
                });
            }
        };

        let domain = GlobalDomain::from_config(&params.domain)?;
        let decomposition =
            Decomposition::compute(&domain, comm.size(), params.domain.decomposition)?;
        let local = decomposition.local_domain(&domain, rank);
        if rank == COORDINATOR {
            info!(
                "run {}: {} active cells over {} worker(s), {:?} decomposition, {} timesteps",
                run_id,
                domain.ncells(),
                comm.size(),
                decomposition.strategy,
                params.nrecs()
            );
        }

        let built = self
            .factory
            .build(rank, &params)
            .map_err(|e| RunError::Configuration(format!("{:#}", e)));
        let collaborators = agree(comm, "configure", built)?;

        let checkpoint = CheckpointTarget {
            directory: params.state.directory.clone(),
            prefix: params.state.prefix.clone(),
            run_id,
            fingerprint: decomposition.fingerprint.clone(),
            ncells: domain.ncells(),
            state_variables: params.state_variable_names(),
        };

        self.ctx = Some(RunContext {
            run_id,
            records: params.time_records(),
            params,
            domain,
            decomposition,
            local,
            cell_params: Vec::new(),
            state: Vec::new(),
            first_timestep: 0,
            collaborators,
            checkpoint,
        });
        Ok(Phase::Configured)
    }

    fn allocate(&mut self) -> RunResult<Phase> {
        let comm = self.comm;
        let ctx = context(&mut self.ctx)?;

        ctx.state = Vec::with_capacity(ctx.local.ncells());
        ctx.cell_params = Vec::with_capacity(ctx.local.ncells());
        let routed = ctx
            .collaborators
            .routing
            .alloc(&ctx.local)
            .map_err(|e| RunError::Configuration(format!("allocating routing: {:#}", e)));
        agree(comm, "allocate", routed)?;
        debug!("allocated {} local cells", ctx.local.ncells());
        Ok(Phase::Allocated)
    }

    fn initialize(&mut self) -> RunResult<Phase> {
        let comm = self.comm;
        let ctx = context(&mut self.ctx)?;
        let ncells = ctx.local.ncells();

        let loaded = ctx
            .collaborators
            .parameters
            .load(&ctx.params, &ctx.local)
            .map_err(|e| RunError::Configuration(format!("loading cell parameters: {:#}", e)))
            .and_then(|rows| {
                if rows.len() == ncells {
                    Ok(rows)
                } else {
                    Err(RunError::Configuration(format!(
                        "parameter loader returned {} rows for {} cells",
                        rows.len(),
                        ncells
                    )))
                }
            });
        ctx.cell_params = agree(comm, "load-parameters", loaded)?;

        let setup = StateSetup {
            params: &ctx.params,
            decomposition: &ctx.decomposition,
            local: &ctx.local,
            cell_params: &ctx.cell_params,
        };
        let initial = ctx
            .collaborators
            .initializer
            .initialize(&setup)
            .and_then(|s| check_initial_state(s, &ctx.local, ctx.params.state.variables.len()));
        let initial = agree(comm, "initialize-state", initial)?;

        let first = initial.restored_from.map_or(0, |t| t + 1);
        let coordinator_first: usize =
            broadcast_value(comm, COORDINATOR, (comm.rank() == COORDINATOR).then_some(&first))?;
        if !comm.all_reduce_and(first == coordinator_first)? {
            return Err(RunError::Restart(format!(
                "workers disagree on the restart timestep: this worker resumes at {}, coordinator at {}",
                first, coordinator_first
            )));
        }

        if comm.rank() == COORDINATOR {
            match &initial.source {
                Some(path) => info!("restarting from {} at timestep {}", path.display(), first),
                None => info!("cold start"),
            }
        }
        ctx.state = initial.cells;
        ctx.first_timestep = first;

        let opened = (|| -> anyhow::Result<()> {
            let last = ctx.records.len().saturating_sub(1);
            let record = ctx
                .records
                .get(first.min(last))
                .context("run has no time records")?;
            ctx.collaborators.output.open(record, &ctx.local)?;
            ctx.collaborators.routing.init()
        })()
        .map_err(|e| RunError::Configuration(format!("opening output: {:#}", e)));
        agree(comm, "open-output", opened)?;

        Ok(Phase::Initialized)
    }

    fn timestep(&mut self, t: usize) -> RunResult<Phase> {
        let comm = self.comm;
        let ctx = context(&mut self.ctx)?;
        let record = *ctx
            .records
            .get(t)
            .ok_or_else(|| RunError::runtime_at(t, "timestep outside the run calendar"))?;

        let advanced = (|| -> anyhow::Result<()> {
            let forcing = ctx
                .collaborators
                .forcing
                .fetch(&record, &ctx.local)
                .context("fetching forcing")?;
            ctx.collaborators
                .executor
                .advance(&record, &ctx.local, &ctx.cell_params, &forcing, &mut ctx.state)
                .context("advancing model")?;
            ctx.collaborators
                .routing
                .run(&record, &ctx.state)
                .context("running routing")?;
            ctx.collaborators
                .output
                .record(&record, &ctx.state)
                .context("recording output")
        })()
        .map_err(|e| RunError::runtime_at(t, format!("{:#}", e)));
        agree(comm, "timestep", advanced)?;

        let routed = ctx.collaborators.routing.write(comm, &record);
        agree(comm, "routing-write", routed)?;

        if should_checkpoint(&ctx.params.state.checkpoint, &record, ctx.records.len()) {
            let path = write_checkpoint(comm, &ctx.checkpoint, &record, &ctx.local, &ctx.state)?;
            self.checkpoints.push(path);
        }

        self.timesteps_run += 1;
        debug!("finished timestep {}", record);
        Ok(running_or_finalizing(t + 1, ctx.records.len()))
    }

    fn finalize(&mut self) -> RunResult<Phase> {
        let comm = self.comm;
        let ctx = context(&mut self.ctx)?;

        let closed = (|| -> anyhow::Result<()> {
            ctx.collaborators.output.close().context("closing output")?;
            ctx.collaborators.routing.finalize().context("finalizing routing")
        })()
        .map_err(RunError::from);
        agree(comm, "finalize", closed)?;
        Ok(Phase::Done)
    }
}

fn check_initial_state(
    state: InitialState,
    local: &LocalDomain,
    nvars: usize,
) -> RunResult<InitialState> {
    let cells: Vec<usize> = state.cells.iter().map(|c| c.cell).collect();
    if cells != local.cells {
        return Err(RunError::Restart(format!(
            "initial state covers cells {:?}, worker {} owns {:?}",
            cells, local.rank, local.cells
        )));
    }
    if let Some(bad) = state.cells.iter().find(|c| c.values.len() != nvars) {
        return Err(RunError::Restart(format!(
            "cell {} has {} state values, expected {}",
            bad.cell,
            bad.values.len(),
            nvars
        )));
    }
    Ok(state)
}

/// One worker's exit status and result.
#[derive(Debug)]
pub struct WorkerOutcome {
    /// `None` when the runtime never started.
    pub rank: Option<usize>,
    pub exit_code: i32,
    pub result: RunResult<RunSummary>,
}

/// Join the process group, run to completion and leave it.
///
/// A runtime init failure is written to stderr and returns at once; the
/// factory is never called.
pub fn start_worker<E: RuntimeEndpoint>(
    endpoint: E,
    config_path: Option<PathBuf>,
    factory: &dyn CollaboratorFactory,
) -> WorkerOutcome {
    let mut comm = match endpoint.init() {
        Ok(comm) => comm,
        Err(failure) => {
            eprintln!("gridrun: {}", failure);
            return WorkerOutcome {
                rank: None,
                exit_code: EXIT_STARTUP_FAILURE,
                result: Err(RunError::Startup(failure.to_string())),
            };
        }
    };

    let rank = comm.rank();
    let span = info_span!("worker", rank, size = comm.size());
    let _entered = span.enter();

    let result = Orchestrator::new(&comm, config_path, factory).run();
    let exit_code = match &result {
        Ok(_) => EXIT_SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            e.exit_code()
        }
    };

    if let Err(e) = comm.finalize() {
        warn!("parallel runtime finalize failed: {}", e);
    }
    if exit_code == EXIT_SUCCESS && rank == COORDINATOR {
        info!("Completed running gridrun {}", env!("CARGO_PKG_VERSION"));
    }

    WorkerOutcome {
        rank: Some(rank),
        exit_code,
        result,
    }
}

/// Run every worker of an in-process group and collect outcomes by rank.
pub async fn run_local(
    group: LocalGroup,
    config_path: Option<PathBuf>,
    factory: Arc<dyn CollaboratorFactory>,
) -> Vec<WorkerOutcome> {
    group
        .launch(move |endpoint| start_worker(endpoint, config_path.clone(), factory.as_ref()))
        .await
}

/// Process exit status for a set of workers: the worst one. A group that
/// ran no workers did not complete the run.
pub fn exit_status(outcomes: &[WorkerOutcome]) -> i32 {
    outcomes
        .iter()
        .map(|o| o.exit_code)
        .max()
        .unwrap_or(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_json;
    use crate::runtime::LocalComm;
    use std::fs;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let mut params: serde_json::Value = serde_json::from_str(&sample_json()).unwrap();
        params["output"]["directory"] = dir.join("out").display().to_string().into();
        params["state"]["directory"] = dir.join("state").display().to_string().into();
        let path = dir.join("gridrun.json");
        fs::write(&path, serde_json::to_string(&params).unwrap()).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_phases_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());

        let phases = LocalGroup::run(2, move |comm: LocalComm| {
            let factory = Collaborators::reference;
            let mut orch = Orchestrator::new(&comm, Some(path.clone()), &factory);
            let mut seen = vec![orch.phase()];
            while orch.phase() != Phase::Done {
                seen.push(orch.step().unwrap());
            }
            seen
        })
        .await;

        let expected_head = [
            Phase::Starting,
            Phase::Configured,
            Phase::Allocated,
            Phase::Initialized,
            Phase::Running { timestep: 0 },
        ];
        for seen in &phases {
            assert_eq!(&seen[..5], &expected_head);
            assert_eq!(seen[seen.len() - 2], Phase::Finalizing);
            assert_eq!(seen.len(), 5 + 7 + 2);
        }
        assert_eq!(phases[0], phases[1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_config_aborts_every_worker() {
        let results = LocalGroup::run(3, |comm: LocalComm| {
            let factory = Collaborators::reference;
            Orchestrator::new(&comm, Some(PathBuf::from("/nonexistent/gridrun.json")), &factory)
                .run()
        })
        .await;

        assert!(matches!(results[0], Err(RunError::Configuration(_))));
        for r in &results[1..] {
            assert!(matches!(r, Err(RunError::PeerAborted { ranks, .. }) if ranks == &vec![0]));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interval_checkpoints_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());

        let outcomes = run_local(LocalGroup::new(3), Some(path), Arc::new(Collaborators::reference)).await;
        assert_eq!(exit_status(&outcomes), EXIT_SUCCESS);
        for outcome in outcomes {
            let summary = outcome.result.unwrap();
            assert_eq!(summary.timesteps_run, 8);
            // interval of 4 over 8 steps: timesteps 0 and 4
            assert_eq!(summary.checkpoints.len(), 2);
        }
        assert!(dir.path().join("state/state.20000101_21600.json").exists());
        assert!(dir.path().join("state/state.20000102_21600.json").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_group_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());

        let outcomes = run_local(LocalGroup::new(0), Some(path), Arc::new(Collaborators::reference)).await;
        assert!(outcomes.is_empty());
        assert_eq!(exit_status(&outcomes), EXIT_FAILURE);
    }
}
