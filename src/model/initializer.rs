use tracing::info;

use super::{CellState, InitialState, StateInitializer, StateSetup};
use crate::checkpoint::{RestoreExpectation, restore_local};
use crate::error::{RunError, RunResult};

/// Cold start from per-variable defaults, or restart from the checkpoint
/// manifest named by `state.init_path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStateInitializer;

impl StateInitializer for DefaultStateInitializer {
    fn initialize(&mut self, setup: &StateSetup<'_>) -> RunResult<InitialState> {
        let params = setup.params;
        let Some(path) = &params.state.init_path else {
            let defaults: Vec<f64> = params.state.variables.iter().map(|v| v.default).collect();
            return Ok(InitialState {
                cells: setup
                    .local
                    .cells
                    .iter()
                    .map(|&cell| CellState {
                        cell,
                        values: defaults.clone(),
                    })
                    .collect(),
                restored_from: None,
                source: None,
            });
        };

        let variables = params.state_variable_names();
        let expect = RestoreExpectation {
            size: setup.decomposition.size,
            ncells: setup.decomposition.ncells(),
            fingerprint: &setup.decomposition.fingerprint,
            state_variables: &variables,
        };
        let (manifest, cells) = restore_local(path, &expect, setup.local)?;

        // The checkpoint must lie on this run's calendar.
        let records = params.time_records();
        match records.get(manifest.timestep) {
            Some(record) if record.end() == manifest.valid_at => {}
            _ => {
                return Err(RunError::Restart(format!(
                    "checkpoint timestep {} ({}) is not on the configured calendar",
                    manifest.timestep, manifest.valid_at
                )));
            }
        }

        info!(
            "restored {} cells from {} (timestep {})",
            cells.len(),
            path.display(),
            manifest.timestep
        );
        Ok(InitialState {
            cells,
            restored_from: Some(manifest.timestep),
            source: Some(path.clone()),
        })
    }
}
