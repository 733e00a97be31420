//! `PointGrid`: a per-rank slice of a distributed set of 64-bit gids.
//!
//! A point grid has no connectivity: it is the column (dof) dimension of the
//! fields that live on it. Each rank holds a list of gids in a fixed local
//! order; `gid -> lid` lookup is O(1) on the owner. A grid is *unique* when
//! no gid is held by more than one rank; overlapped grids deliberately break
//! that property.
//!
//! The collective queries (`get_owners`, `unique_gids`, `is_unique`) are
//! implemented over the [`Communicator`](crate::comm::Communicator)
//! all-gather primitives: every rank learns the full gid partition once and
//! answers lookups from the gathered map. Where a gid is held by several
//! ranks, the smallest rank wins, deterministically.

use std::collections::{HashMap, HashSet};

use crate::comm::{CommTag, Communicator};
use crate::error::RemapError;

#[derive(Clone, Debug)]
pub struct PointGrid {
    name: String,
    num_levels: usize,
    gids: Vec<u64>,
    lid_of: HashMap<u64, usize>,
}

impl PointGrid {
    /// Build a grid from this rank's gid list. Local duplicates are rejected.
    pub fn new(
        name: impl Into<String>,
        gids: Vec<u64>,
        num_levels: usize,
    ) -> Result<Self, RemapError> {
        let name = name.into();
        let mut lid_of = HashMap::with_capacity(gids.len());
        for (lid, &g) in gids.iter().enumerate() {
            if lid_of.insert(g, lid).is_some() {
                return Err(RemapError::DuplicateGid { gid: g, grid: name });
            }
        }
        Ok(Self {
            name,
            num_levels,
            gids,
            lid_of,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of vertical levels fields on this grid carry (0 for pure 2-d).
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    #[inline]
    pub fn num_local_dofs(&self) -> usize {
        self.gids.len()
    }

    /// This rank's gids, in local-id order.
    #[inline]
    pub fn gids(&self) -> &[u64] {
        &self.gids
    }

    #[inline]
    pub fn gid(&self, lid: usize) -> u64 {
        self.gids[lid]
    }

    /// Local id of `gid` on this rank, if held here.
    #[inline]
    pub fn lid(&self, gid: u64) -> Option<usize> {
        self.lid_of.get(&gid).copied()
    }

    /// Like [`lid`](Self::lid), but an unknown gid is an error.
    pub fn lid_checked(&self, gid: u64) -> Result<usize, RemapError> {
        self.lid(gid).ok_or_else(|| RemapError::UnknownGid {
            gid,
            grid: self.name.clone(),
        })
    }

    /// Owning rank of each queried gid. Where a gid is held by several ranks
    /// the smallest holder is the owner.
    pub fn get_owners<C: Communicator>(
        &self,
        comm: &C,
        gids: &[u64],
        tag: CommTag,
    ) -> Result<Vec<usize>, RemapError> {
        let all = comm.all_gather_v_u64(&self.gids, tag)?;
        let mut owner_of: HashMap<u64, usize> = HashMap::new();
        for (rank, list) in all.iter().enumerate() {
            for &g in list {
                owner_of.entry(g).or_insert(rank);
            }
        }
        gids.iter()
            .map(|&g| {
                owner_of
                    .get(&g)
                    .copied()
                    .ok_or_else(|| RemapError::UnknownGid {
                        gid: g,
                        grid: self.name.clone(),
                    })
            })
            .collect()
    }

    /// True iff no gid is held by more than one rank.
    pub fn is_unique<C: Communicator>(&self, comm: &C, tag: CommTag) -> Result<bool, RemapError> {
        let all = comm.all_gather_v_u64(&self.gids, tag)?;
        let mut seen = HashSet::new();
        for list in &all {
            for &g in list {
                if !seen.insert(g) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Deduplicate this (possibly overlapped) grid across ranks: each rank
    /// keeps the gids no smaller rank also holds. The union of the results is
    /// the distinct gid set, partitioned with exactly one owner per gid.
    pub fn unique_gids<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
    ) -> Result<Vec<u64>, RemapError> {
        let all = comm.all_gather_v_u64(&self.gids, tag)?;
        let me = comm.rank();
        let below: HashSet<u64> = all[..me].iter().flatten().copied().collect();
        Ok(self
            .gids
            .iter()
            .copied()
            .filter(|g| !below.contains(g))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{NoComm, RayonComm};

    #[test]
    fn lid_gid_roundtrip() {
        let grid = PointGrid::new("src", vec![30, 10, 20], 4).unwrap();
        assert_eq!(grid.num_local_dofs(), 3);
        assert_eq!(grid.num_levels(), 4);
        assert_eq!(grid.gid(1), 10);
        assert_eq!(grid.lid(20), Some(2));
        assert_eq!(grid.lid(99), None);
        assert!(matches!(
            grid.lid_checked(99),
            Err(RemapError::UnknownGid { gid: 99, .. })
        ));
    }

    #[test]
    fn duplicate_gid_rejected() {
        let err = PointGrid::new("src", vec![1, 2, 1], 0).unwrap_err();
        assert!(matches!(err, RemapError::DuplicateGid { gid: 1, .. }));
    }

    #[test]
    fn serial_owner_lookup() {
        let comm = NoComm;
        let grid = PointGrid::new("src", vec![5, 6, 7], 0).unwrap();
        let owners = grid.get_owners(&comm, &[7, 5], CommTag::new(840)).unwrap();
        assert_eq!(owners, vec![0, 0]);
        assert!(grid.is_unique(&comm, CommTag::new(841)).unwrap());
        assert_eq!(
            grid.unique_gids(&comm, CommTag::new(842)).unwrap(),
            vec![5, 6, 7]
        );
    }

    #[test]
    fn overlapped_grid_dedup_prefers_smallest_rank() {
        let handles: Vec<_> = (0..2)
            .map(|r| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(r, 2);
                    // gid 100 is held on both ranks.
                    let gids = if r == 0 { vec![100, 101] } else { vec![100, 102] };
                    let grid = PointGrid::new("ov", gids, 0).unwrap();
                    assert!(!grid.is_unique(&comm, CommTag::new(850)).unwrap());
                    grid.unique_gids(&comm, CommTag::new(852)).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], vec![100, 101]);
        assert_eq!(results[1], vec![102]);
    }
}
