use anyhow::bail;
use chrono::{Datelike, NaiveDateTime};
use std::f64::consts::TAU;

use super::{ForcingProvider, ForcingRecord};
use crate::config::GlobalParameters;
use crate::domain::LocalDomain;
use crate::time::TimeRecord;

/// Deterministic forcing: every value is a function of the cell index and
/// the timestep's start instant only, so any worker layout and any restart
/// point reproduce the same series.
#[derive(Debug, Clone)]
pub struct SyntheticForcing {
    variables: Vec<String>,
    available_until: Option<NaiveDateTime>,
}

impl SyntheticForcing {
    pub fn new(params: &GlobalParameters) -> Self {
        Self {
            variables: params.forcing.variables.clone(),
            available_until: params.forcing.available_until,
        }
    }

    fn value(name: &str, slot: usize, cell: usize, record: &TimeRecord) -> f64 {
        let phase = cell as f64 * 0.37;
        let hours = record.start.and_utc().timestamp() as f64 / 3600.0;
        match name {
            // mm per step, storm cycle of five days
            "prec" => 2.0 * (1.0 + (hours / 24.0 * TAU / 5.0 + phase).sin()),
            // deg C, seasonal
            "temp" => {
                let doy = record.start.ordinal0() as f64;
                10.0 + 8.0 * (doy / 365.0 * TAU + phase).sin()
            }
            _ => 1.0 + 0.5 * (hours * 0.1 + phase + slot as f64).sin(),
        }
    }
}

impl ForcingProvider for SyntheticForcing {
    fn fetch(&mut self, record: &TimeRecord, local: &LocalDomain) -> anyhow::Result<Vec<ForcingRecord>> {
        if let Some(until) = self.available_until {
            if record.end() > until {
                bail!(
                    "forcing data ends at {}, timestep {} needs data through {}",
                    until,
                    record,
                    record.end()
                );
            }
        }

        Ok(local
            .cells
            .iter()
            .map(|&cell| ForcingRecord {
                cell,
                values: self
                    .variables
                    .iter()
                    .enumerate()
                    .map(|(slot, name)| Self::value(name, slot, cell, record))
                    .collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::domain::{Decomposition, GlobalDomain};

    #[test]
    fn test_same_inputs_same_values() {
        let params = sample();
        let domain = GlobalDomain::from_config(&params.domain).unwrap();
        let one = Decomposition::compute(&domain, 1, params.domain.decomposition).unwrap();
        let three = Decomposition::compute(&domain, 3, params.domain.decomposition).unwrap();
        let record = params.time_records()[5];

        let all = SyntheticForcing::new(&params)
            .fetch(&record, &one.local_domain(&domain, 0))
            .unwrap();
        let part = SyntheticForcing::new(&params)
            .fetch(&record, &three.local_domain(&domain, 2))
            .unwrap();

        for rec in part {
            let same = all.iter().find(|r| r.cell == rec.cell).unwrap();
            assert_eq!(same, &rec);
            assert!(rec.values[0] >= 0.0);
        }
    }

    #[test]
    fn test_fails_past_available_data() {
        let mut params = sample();
        let records = params.time_records();
        params.forcing.available_until = Some(records[2].end());
        let domain = GlobalDomain::from_config(&params.domain).unwrap();
        let d = Decomposition::compute(&domain, 1, params.domain.decomposition).unwrap();
        let local = d.local_domain(&domain, 0);

        let mut forcing = SyntheticForcing::new(&params);
        assert!(forcing.fetch(&records[2], &local).is_ok());
        let err = forcing.fetch(&records[3], &local).unwrap_err();
        assert!(err.to_string().contains("forcing data ends"));
    }
}
