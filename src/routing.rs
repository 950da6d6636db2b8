//! Optional routing extension.
//!
//! The orchestrator calls every hook on every worker; whether anything
//! happens is decided by `routing` in the broadcast configuration, so all
//! workers take the same branch.

use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

use crate::config::GlobalParameters;
use crate::domain::LocalDomain;
use crate::error::{RunError, RunResult};
use crate::model::{CellState, require_variable};
use crate::runtime::{COORDINATOR, Communicator, gather_value};
use crate::time::TimeRecord;

/// Lifecycle hooks for a routing component. All default to no-ops.
pub trait RoutingExtension: Send {
    fn alloc(&mut self, _local: &LocalDomain) -> anyhow::Result<()> {
        Ok(())
    }

    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Local routing computation for one timestep.
    fn run(&mut self, _record: &TimeRecord, _state: &[CellState]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Collective: must be called by every worker after `run`.
    fn write(&mut self, _comm: &dyn Communicator, _record: &TimeRecord) -> RunResult<()> {
        Ok(())
    }

    fn finalize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Routing switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRouting;

impl RoutingExtension for NoRouting {}

/// Domain outlet: total runoff over all cells, appended by the coordinator
/// to `routing.outlet_path` as `timestep,end,total` lines.
///
/// `run` and `write` are gated separately. With `run` off, `write` still
/// reports, carrying zero flow.
#[derive(Debug, Clone)]
pub struct OutletRouting {
    run_enabled: bool,
    write_enabled: bool,
    outlet_path: Option<PathBuf>,
    runoff: usize,
    rank: usize,
    local_flow: f64,
}

impl OutletRouting {
    pub fn new(params: &GlobalParameters) -> anyhow::Result<Self> {
        let state = params.state_variable_names();
        Ok(Self {
            run_enabled: params.routing.run,
            write_enabled: params.routing.write,
            outlet_path: params.routing.outlet_path.clone(),
            runoff: require_variable(&state, "runoff", "state.variables")?,
            rank: 0,
            local_flow: 0.0,
        })
    }
}

impl RoutingExtension for OutletRouting {
    fn alloc(&mut self, local: &LocalDomain) -> anyhow::Result<()> {
        self.rank = local.rank;
        Ok(())
    }

    fn init(&mut self) -> anyhow::Result<()> {
        if self.rank != COORDINATOR || !self.write_enabled {
            return Ok(());
        }
        if let Some(path) = &self.outlet_path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, "timestep,end,total_runoff\n")
                .with_context(|| format!("creating outlet file {}", path.display()))?;
        }
        Ok(())
    }

    fn run(&mut self, _record: &TimeRecord, state: &[CellState]) -> anyhow::Result<()> {
        if self.run_enabled {
            self.local_flow = state.iter().map(|c| c.values[self.runoff]).sum();
        }
        Ok(())
    }

    fn write(&mut self, comm: &dyn Communicator, record: &TimeRecord) -> RunResult<()> {
        if !self.write_enabled {
            return Ok(());
        }
        let Some(flows) = gather_value(comm, COORDINATOR, &self.local_flow)? else {
            return Ok(());
        };
        let Some(path) = &self.outlet_path else {
            return Ok(());
        };

        let total: f64 = flows.iter().sum();
        debug!("outlet flow at {}: {}", record, total);
        OpenOptions::new()
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{},{},{}", record.index, record.end(), total))
            .map_err(|e| {
                RunError::runtime_at(record.index, format!("writing {}: {}", path.display(), e))
            })
    }
}
