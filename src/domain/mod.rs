//! Global domain and its partition across workers.
//!
//! A [`Decomposition`] is a pure function of the active cell list and the
//! group size. Checkpoints record its fingerprint, so the same inputs must
//! always produce the same layout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

use crate::config::DomainSection;
use crate::error::{RunError, RunResult};
use crate::runtime::{Communicator, agree, gather_value, scatter_value};

/// How cells are dealt out to ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionStrategy {
    /// Cell `i` goes to rank `i mod P`; spreads spatially clustered load.
    #[default]
    RoundRobin,
    /// Contiguous runs of cells; sizes differ by at most one.
    Block,
}

/// Every active cell of the run, ordered by spatial index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDomain {
    pub nx: usize,
    pub ny: usize,
    cells: Vec<usize>,
}

impl GlobalDomain {
    /// Build from explicit spatial indices. Duplicates and out-of-grid
    /// indices are rejected.
    pub fn new(nx: usize, ny: usize, active: impl IntoIterator<Item = usize>) -> RunResult<Self> {
        let ncells_total = nx * ny;
        let mut seen = BTreeSet::new();
        for idx in active {
            if idx >= ncells_total {
                return Err(RunError::Configuration(format!(
                    "cell index {} outside {}x{} grid",
                    idx, nx, ny
                )));
            }
            if !seen.insert(idx) {
                return Err(RunError::Configuration(format!("duplicate cell index {}", idx)));
            }
        }
        Ok(Self {
            nx,
            ny,
            cells: seen.into_iter().collect(),
        })
    }

    pub fn from_config(section: &DomainSection) -> RunResult<Self> {
        let inactive: BTreeSet<usize> = section.inactive.iter().copied().collect();
        match &section.active {
            Some(active) => Self::new(
                section.nx,
                section.ny,
                active.iter().copied().filter(|i| !inactive.contains(i)),
            ),
            None => Self::new(
                section.nx,
                section.ny,
                (0..section.nx * section.ny).filter(|i| !inactive.contains(i)),
            ),
        }
    }

    /// Number of active cells.
    pub fn ncells(&self) -> usize {
        self.cells.len()
    }

    /// Spatial indices in global order.
    pub fn cells(&self) -> &[usize] {
        &self.cells
    }
}

/// Partition of a [`GlobalDomain`] over `size` workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub strategy: DecompositionStrategy,
    pub size: usize,
    /// Number of cells owned by each rank.
    pub local_sizes: Vec<usize>,
    /// Start of each rank's block in `mapping`.
    pub offsets: Vec<usize>,
    /// `mapping[offsets[r] + k]` is the global position of rank `r`'s `k`-th cell.
    pub mapping: Vec<usize>,
    /// SHA-256 over strategy, size and mapping.
    pub fingerprint: String,
}

impl Decomposition {
    pub fn compute(
        domain: &GlobalDomain,
        size: usize,
        strategy: DecompositionStrategy,
    ) -> RunResult<Self> {
        let ncells = domain.ncells();
        if size == 0 {
            return Err(RunError::Partition("process group is empty".to_string()));
        }
        if ncells == 0 {
            return Err(RunError::Partition("domain has no active cells".to_string()));
        }
        if ncells < size {
            return Err(RunError::Partition(format!(
                "{} active cells cannot cover {} workers; at least one would own no cells",
                ncells, size
            )));
        }

        let mut owners: Vec<Vec<usize>> = vec![Vec::new(); size];
        match strategy {
            DecompositionStrategy::RoundRobin => {
                for pos in 0..ncells {
                    owners[pos % size].push(pos);
                }
            }
            DecompositionStrategy::Block => {
                let base = ncells / size;
                let rem = ncells % size;
                let mut cursor = 0;
                for (rank, owned) in owners.iter_mut().enumerate() {
                    let n = base + usize::from(rank < rem);
                    owned.extend(cursor..cursor + n);
                    cursor += n;
                }
            }
        }

        if let Some(rank) = owners.iter().position(|o| o.is_empty()) {
            return Err(RunError::Partition(format!("worker {} owns no cells", rank)));
        }

        let local_sizes: Vec<usize> = owners.iter().map(Vec::len).collect();
        let offsets: Vec<usize> = local_sizes
            .iter()
            .scan(0, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect();
        let mapping: Vec<usize> = owners.into_iter().flatten().collect();
        let fingerprint = fingerprint(strategy, size, domain.cells(), &mapping);

        Ok(Self {
            strategy,
            size,
            local_sizes,
            offsets,
            mapping,
            fingerprint,
        })
    }

    pub fn ncells(&self) -> usize {
        self.mapping.len()
    }

    /// Global positions owned by `rank`, in local order.
    pub fn positions_of(&self, rank: usize) -> &[usize] {
        let start = self.offsets[rank];
        &self.mapping[start..start + self.local_sizes[rank]]
    }

    pub fn local_domain(&self, domain: &GlobalDomain, rank: usize) -> LocalDomain {
        let positions = self.positions_of(rank).to_vec();
        let cells: Vec<usize> = positions.iter().map(|&p| domain.cells()[p]).collect();
        let global_to_local = cells
            .iter()
            .enumerate()
            .map(|(local, &cell)| (cell, local))
            .collect();
        LocalDomain {
            rank,
            positions,
            cells,
            global_to_local,
        }
    }
}

fn fingerprint(
    strategy: DecompositionStrategy,
    size: usize,
    cells: &[usize],
    mapping: &[usize],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}/{}", strategy, size).as_bytes());
    for &pos in mapping {
        hasher.update((cells[pos] as u64).to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Cells owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDomain {
    pub rank: usize,
    /// Global positions (indices into `GlobalDomain::cells`), local order.
    pub positions: Vec<usize>,
    /// Spatial cell indices, local order.
    pub cells: Vec<usize>,
    global_to_local: HashMap<usize, usize>,
}

impl LocalDomain {
    pub fn ncells(&self) -> usize {
        self.cells.len()
    }

    /// Local position of spatial cell `cell`, if owned here.
    pub fn local_index(&self, cell: usize) -> Option<usize> {
        self.global_to_local.get(&cell).copied()
    }
}

/// Distribute a global, naturally ordered array from `root`.
///
/// `global` must be `Some` on `root` with one entry per active cell. The
/// root's input is checked collectively before any data moves.
pub fn scatter_cells<C, T>(
    comm: &C,
    decomposition: &Decomposition,
    root: usize,
    global: Option<&[T]>,
) -> RunResult<Vec<T>>
where
    C: Communicator + ?Sized,
    T: Clone + Serialize + DeserializeOwned,
{
    let prepared = if comm.rank() == root {
        match global {
            Some(values) if values.len() == decomposition.ncells() => Ok(Some(
                (0..decomposition.size)
                    .map(|rank| {
                        decomposition
                            .positions_of(rank)
                            .iter()
                            .map(|&pos| values[pos].clone())
                            .collect::<Vec<T>>()
                    })
                    .collect(),
            )),
            Some(values) => Err(RunError::Collective(format!(
                "scatter expected {} values, got {}",
                decomposition.ncells(),
                values.len()
            ))),
            None => Err(RunError::Collective("scatter root supplied no values".to_string())),
        }
    } else {
        Ok(None)
    };
    let chunks = agree(comm, "scatter", prepared)?;
    scatter_value(comm, root, chunks)
}

/// Collect per-worker arrays into one naturally ordered array on `root`.
pub fn gather_cells<C, T>(
    comm: &C,
    decomposition: &Decomposition,
    root: usize,
    local: &[T],
) -> RunResult<Option<Vec<T>>>
where
    C: Communicator + ?Sized,
    T: Clone + Serialize + DeserializeOwned,
{
    let Some(parts) = gather_value(comm, root, &local.to_vec())? else {
        return Ok(None);
    };

    let mut global: Vec<Option<T>> = vec![None; decomposition.ncells()];
    for (rank, part) in parts.into_iter().enumerate() {
        let positions = decomposition.positions_of(rank);
        if part.len() != positions.len() {
            return Err(RunError::Collective(format!(
                "worker {} sent {} values for {} cells",
                rank,
                part.len(),
                positions.len()
            )));
        }
        for (&pos, value) in positions.iter().zip(part) {
            global[pos] = Some(value);
        }
    }

    global
        .into_iter()
        .collect::<Option<Vec<T>>>()
        .map(Some)
        .ok_or_else(|| RunError::Collective("gather left cells unfilled".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{COORDINATOR, LocalGroup};

    fn domain(n: usize) -> GlobalDomain {
        GlobalDomain::new(n, 1, 0..n).unwrap()
    }

    #[test]
    fn test_partition_is_complete_and_disjoint() {
        for strategy in [DecompositionStrategy::RoundRobin, DecompositionStrategy::Block] {
            for g in 1..=24 {
                for p in 1..=g {
                    let d = Decomposition::compute(&domain(g), p, strategy).unwrap();
                    let mut seen = vec![0usize; g];
                    for rank in 0..p {
                        assert!(!d.positions_of(rank).is_empty());
                        for &pos in d.positions_of(rank) {
                            seen[pos] += 1;
                        }
                    }
                    assert!(seen.iter().all(|&c| c == 1), "g={} p={} {:?}", g, p, strategy);
                    assert_eq!(d.local_sizes.iter().sum::<usize>(), g);
                }
            }
        }
    }

    #[test]
    fn test_partition_is_deterministic() {
        let dom = GlobalDomain::new(10, 10, (0..100).filter(|i| i % 3 != 0)).unwrap();
        let a = Decomposition::compute(&dom, 7, DecompositionStrategy::RoundRobin).unwrap();
        let b = Decomposition::compute(&dom, 7, DecompositionStrategy::RoundRobin).unwrap();
        assert_eq!(a, b);

        let other = Decomposition::compute(&dom, 6, DecompositionStrategy::RoundRobin).unwrap();
        assert_ne!(a.fingerprint, other.fingerprint);
    }

    #[test]
    fn test_round_robin_layout() {
        let d = Decomposition::compute(&domain(7), 3, DecompositionStrategy::RoundRobin).unwrap();
        assert_eq!(d.local_sizes, vec![3, 2, 2]);
        assert_eq!(d.offsets, vec![0, 3, 5]);
        assert_eq!(d.mapping, vec![0, 3, 6, 1, 4, 2, 5]);
    }

    #[test]
    fn test_block_layout() {
        let d = Decomposition::compute(&domain(7), 3, DecompositionStrategy::Block).unwrap();
        assert_eq!(d.local_sizes, vec![3, 2, 2]);
        assert_eq!(d.mapping, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_too_many_workers_is_partition_error() {
        let err = Decomposition::compute(&domain(3), 4, DecompositionStrategy::RoundRobin)
            .unwrap_err();
        assert!(matches!(err, RunError::Partition(_)));
    }

    #[test]
    fn test_mask_and_local_lookup() {
        let section = DomainSection {
            nx: 3,
            ny: 2,
            active: None,
            inactive: vec![1, 4],
            decomposition: DecompositionStrategy::RoundRobin,
        };
        let dom = GlobalDomain::from_config(&section).unwrap();
        assert_eq!(dom.cells(), &[0, 2, 3, 5]);

        let d = Decomposition::compute(&dom, 2, section.decomposition).unwrap();
        let local = d.local_domain(&dom, 1);
        assert_eq!(local.cells, vec![2, 5]);
        assert_eq!(local.local_index(5), Some(1));
        assert_eq!(local.local_index(0), None);
    }

    #[test]
    fn test_rejects_out_of_grid_cells() {
        assert!(GlobalDomain::new(2, 2, [0, 4]).is_err());
        assert!(GlobalDomain::new(2, 2, [1, 1]).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scatter_gather_restore_natural_order() {
        let dom = domain(10);
        let d = Decomposition::compute(&dom, 3, DecompositionStrategy::RoundRobin).unwrap();
        let results = LocalGroup::run(3, move |comm| {
            let rank = comm.rank();
            let global: Vec<u64> = (0..10).map(|i| i * 100).collect();
            let local = scatter_cells(
                &comm,
                &d,
                COORDINATOR,
                (rank == COORDINATOR).then_some(global.as_slice()),
            )
            .unwrap();
            let expected: Vec<u64> = d.positions_of(rank).iter().map(|&p| p as u64 * 100).collect();
            assert_eq!(local, expected);
            gather_cells(&comm, &d, COORDINATOR, &local).unwrap()
        })
        .await;

        assert_eq!(results[0], Some((0..10).map(|i| i * 100).collect()));
        assert!(results[1].is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scatter_with_short_input_fails_every_worker() {
        let dom = domain(6);
        let d = Decomposition::compute(&dom, 2, DecompositionStrategy::Block).unwrap();
        let results = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            LocalGroup::run(2, move |comm| {
                let short = [1.0f64, 2.0, 3.0];
                scatter_cells(
                    &comm,
                    &d,
                    COORDINATOR,
                    (comm.rank() == COORDINATOR).then_some(&short[..]),
                )
            }),
        )
        .await
        .expect("scatter hung");

        assert!(matches!(&results[0], Err(RunError::Collective(msg)) if msg.contains("expected 6 values, got 3")));
        assert!(matches!(
            &results[1],
            Err(RunError::PeerAborted { phase, ranks }) if phase == "scatter" && ranks == &vec![0]
        ));
    }
}
