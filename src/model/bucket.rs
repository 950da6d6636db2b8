use anyhow::{bail, ensure};

use super::{CellParameters, CellState, ForcingRecord, TimestepExecutor, require_variable};
use crate::config::GlobalParameters;
use crate::domain::LocalDomain;
use crate::time::TimeRecord;

const DEFAULT_CAPACITY: f64 = 100.0;
const DEFAULT_RECESSION: f64 = 0.05;

/// Single linear reservoir per cell.
///
/// Precipitation fills `storage`; anything above `capacity` spills, and a
/// fraction `k` of the remainder drains each step. `runoff` is spill plus
/// drainage for the step.
#[derive(Debug, Clone)]
pub struct BucketModel {
    storage: usize,
    runoff: usize,
    prec: usize,
}

impl BucketModel {
    pub fn new(params: &GlobalParameters) -> anyhow::Result<Self> {
        let state = params.state_variable_names();
        Ok(Self {
            storage: require_variable(&state, "storage", "state.variables")?,
            runoff: require_variable(&state, "runoff", "state.variables")?,
            prec: require_variable(&params.forcing.variables, "prec", "forcing.variables")?,
        })
    }
}

impl TimestepExecutor for BucketModel {
    fn advance(
        &mut self,
        record: &TimeRecord,
        local: &LocalDomain,
        cell_params: &[CellParameters],
        forcing: &[ForcingRecord],
        state: &mut [CellState],
    ) -> anyhow::Result<()> {
        ensure!(
            forcing.len() == state.len() && state.len() == local.ncells(),
            "timestep {}: {} forcing records for {} cells",
            record.index,
            forcing.len(),
            state.len()
        );

        for (i, (cell, input)) in state.iter_mut().zip(forcing).enumerate() {
            ensure!(
                cell.cell == input.cell,
                "forcing for cell {} delivered to cell {}",
                input.cell,
                cell.cell
            );
            let row = cell_params.get(i);
            let capacity = row.and_then(|p| p.get("capacity")).copied().unwrap_or(DEFAULT_CAPACITY);
            let k = row.and_then(|p| p.get("k")).copied().unwrap_or(DEFAULT_RECESSION);
            if !(0.0..=1.0).contains(&k) || capacity < 0.0 {
                bail!("cell {}: invalid bucket parameters capacity={} k={}", cell.cell, capacity, k);
            }

            let mut storage = cell.values[self.storage] + input.values[self.prec];
            let spill = (storage - capacity).max(0.0);
            storage -= spill;
            let drain = k * storage;
            storage -= drain;

            if !storage.is_finite() || !spill.is_finite() {
                bail!("cell {}: non-finite storage at timestep {}", cell.cell, record.index);
            }
            cell.values[self.storage] = storage;
            cell.values[self.runoff] = spill + drain;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::domain::{Decomposition, GlobalDomain};

    fn one_cell() -> (GlobalParameters, LocalDomain) {
        let mut params = sample();
        params.domain.active = Some(vec![0]);
        params.domain.inactive.clear();
        let domain = GlobalDomain::from_config(&params.domain).unwrap();
        let d = Decomposition::compute(&domain, 1, params.domain.decomposition).unwrap();
        let local = d.local_domain(&domain, 0);
        (params, local)
    }

    #[test]
    fn test_spill_and_drain() {
        let (params, local) = one_cell();
        let record = params.time_records()[0];
        let mut model = BucketModel::new(&params).unwrap();
        let mut state = vec![CellState { cell: 0, values: vec![95.0, 0.0] }];
        let forcing = vec![ForcingRecord { cell: 0, values: vec![10.0, 5.0] }];
        let mut row = CellParameters::new();
        row.insert("k".to_string(), 0.5);

        model.advance(&record, &local, &[row], &forcing, &mut state).unwrap();
        assert_eq!(state[0].values, vec![50.0, 55.0]);
    }

    #[test]
    fn test_rejects_non_finite_input() {
        let (params, local) = one_cell();
        let record = params.time_records()[0];
        let mut model = BucketModel::new(&params).unwrap();
        let mut state = vec![CellState { cell: 0, values: vec![1.0, 0.0] }];
        let forcing = vec![ForcingRecord { cell: 0, values: vec![f64::NAN, 0.0] }];

        assert!(model.advance(&record, &local, &[], &forcing, &mut state).is_err());
    }

    #[test]
    fn test_requires_storage_variable() {
        let mut params = sample();
        params.state.variables.retain(|v| v.name != "storage");
        let err = BucketModel::new(&params).unwrap_err();
        assert!(err.to_string().contains("`storage`"));
    }
}
