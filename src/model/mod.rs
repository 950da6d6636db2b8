//! Collaborator boundary: the subsystems the orchestrator drives but does
//! not implement. Each worker owns one [`Collaborators`] bundle, built at
//! configuration time by a [`CollaboratorFactory`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::GlobalParameters;
use crate::domain::{Decomposition, LocalDomain};
use crate::error::RunResult;
use crate::time::TimeRecord;

mod bucket;
mod forcing;
mod initializer;
mod parameters;

pub use bucket::BucketModel;
pub use forcing::SyntheticForcing;
pub use initializer::DefaultStateInitializer;
pub use parameters::{JsonParameterFile, ParameterFile};

pub use crate::output::HistoryStreamer;
pub use crate::routing::{NoRouting, OutletRouting, RoutingExtension};

/// Evolving physical state of one cell, ordered like `state.variables`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    /// Spatial index of the cell.
    pub cell: usize,
    pub values: Vec<f64>,
}

/// Driving data for one cell and one timestep, ordered like `forcing.variables`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcingRecord {
    pub cell: usize,
    pub values: Vec<f64>,
}

/// Named per-cell parameters.
pub type CellParameters = BTreeMap<String, f64>;

/// Everything a state initializer may consult.
pub struct StateSetup<'a> {
    pub params: &'a GlobalParameters,
    pub decomposition: &'a Decomposition,
    pub local: &'a LocalDomain,
    pub cell_params: &'a [CellParameters],
}

/// State produced by cold start or restart.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialState {
    pub cells: Vec<CellState>,
    /// Timestep the restored checkpoint was written at; `None` on cold start.
    pub restored_from: Option<usize>,
    pub source: Option<PathBuf>,
}

/// Loads per-cell parameters for the locally owned cells.
pub trait ParameterLoader: Send {
    fn load(
        &mut self,
        params: &GlobalParameters,
        local: &LocalDomain,
    ) -> anyhow::Result<Vec<CellParameters>>;
}

/// Builds default state or restores it from a checkpoint.
///
/// Restores must reject checkpoints whose partition does not match
/// `setup.decomposition`.
pub trait StateInitializer: Send {
    fn initialize(&mut self, setup: &StateSetup<'_>) -> RunResult<InitialState>;
}

/// Supplies forcing for every locally owned cell.
pub trait ForcingProvider: Send {
    /// Fails when the data does not cover `record`.
    fn fetch(&mut self, record: &TimeRecord, local: &LocalDomain)
    -> anyhow::Result<Vec<ForcingRecord>>;
}

/// Advances the physical model by one timestep. No I/O.
pub trait TimestepExecutor: Send {
    fn advance(
        &mut self,
        record: &TimeRecord,
        local: &LocalDomain,
        cell_params: &[CellParameters],
        forcing: &[ForcingRecord],
        state: &mut [CellState],
    ) -> anyhow::Result<()>;
}

/// Buffers per-stream aggregates and flushes them on each stream's cadence.
pub trait OutputStreamer: Send {
    fn open(&mut self, first: &TimeRecord, local: &LocalDomain) -> anyhow::Result<()>;

    fn record(&mut self, record: &TimeRecord, state: &[CellState]) -> anyhow::Result<()>;

    /// Flush partial aggregates and close every stream.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// One worker's set of collaborators.
pub struct Collaborators {
    pub parameters: Box<dyn ParameterLoader>,
    pub initializer: Box<dyn StateInitializer>,
    pub forcing: Box<dyn ForcingProvider>,
    pub executor: Box<dyn TimestepExecutor>,
    pub output: Box<dyn OutputStreamer>,
    pub routing: Box<dyn RoutingExtension>,
}

impl Collaborators {
    /// The built-in reference set: JSON parameters, synthetic forcing,
    /// bucket model, history files, and routing when configured.
    pub fn reference(rank: usize, params: &GlobalParameters) -> anyhow::Result<Self> {
        let routing: Box<dyn RoutingExtension> = if params.routing.enabled {
            Box::new(OutletRouting::new(params)?)
        } else {
            Box::new(NoRouting)
        };

        Ok(Self {
            parameters: Box::new(JsonParameterFile::from_config()),
            initializer: Box::new(DefaultStateInitializer),
            forcing: Box::new(SyntheticForcing::new(params)),
            executor: Box::new(BucketModel::new(params)?),
            output: Box::new(HistoryStreamer::new(rank, params)),
            routing,
        })
    }
}

/// Builds a worker's collaborators once configuration is known.
pub trait CollaboratorFactory: Send + Sync {
    fn build(&self, rank: usize, params: &GlobalParameters) -> anyhow::Result<Collaborators>;
}

impl<F> CollaboratorFactory for F
where
    F: Fn(usize, &GlobalParameters) -> anyhow::Result<Collaborators> + Send + Sync,
{
    fn build(&self, rank: usize, params: &GlobalParameters) -> anyhow::Result<Collaborators> {
        self(rank, params)
    }
}

/// Look up a variable's slot or fail with a configuration message.
pub(crate) fn require_variable(names: &[String], name: &str, section: &str) -> anyhow::Result<usize> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| anyhow::anyhow!("{} must include a `{}` variable", section, name))
}
