use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{CellParameters, ParameterLoader};
use crate::config::GlobalParameters;
use crate::domain::LocalDomain;

/// On-disk parameter table: grid-wide defaults plus per-cell overrides
/// keyed by spatial index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterFile {
    #[serde(default)]
    pub defaults: CellParameters,
    #[serde(default)]
    pub cells: BTreeMap<usize, CellParameters>,
}

impl ParameterFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading parameter file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Defaults overlaid with the cell's own entries.
    pub fn for_cell(&self, cell: usize) -> CellParameters {
        let mut merged = self.defaults.clone();
        if let Some(own) = self.cells.get(&cell) {
            merged.extend(own.iter().map(|(k, v)| (k.clone(), *v)));
        }
        merged
    }
}

/// Reads `parameters.path` (or an explicit override) and hands each worker
/// the rows for its own cells.
#[derive(Debug, Clone, Default)]
pub struct JsonParameterFile {
    path: Option<PathBuf>,
}

impl JsonParameterFile {
    pub fn from_config() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl ParameterLoader for JsonParameterFile {
    fn load(
        &mut self,
        params: &GlobalParameters,
        local: &LocalDomain,
    ) -> anyhow::Result<Vec<CellParameters>> {
        let path = self.path.as_ref().or(params.parameters.path.as_ref());
        let table = match path {
            Some(path) => {
                debug!("loading cell parameters from {}", path.display());
                ParameterFile::from_file(path)?
            }
            None => ParameterFile::default(),
        };
        Ok(local.cells.iter().map(|&cell| table.for_cell(cell)).collect())
    }
}
