//! CRS construction over the overlapped target grid.
//!
//! Once a rank knows its triplet ids, it reads `row`, `col`, `S` in one
//! gather pass and freezes them into a dense-row CRS matrix whose rows are
//! the distinct target gids touched locally (the overlapped target grid, in
//! ascending gid order) and whose columns are source-local ids.
//!
//! The triplet permutation is sorted *stably* by row gid, preserving the
//! held order within each row, so repeated constructions sum row
//! contributions in the same order.

use std::collections::BTreeSet;

use crate::error::RemapError;
use crate::grid::PointGrid;
use crate::io::MapFileReader;

/// Immutable dense-row sparse matrix: `row_offsets[r]..row_offsets[r+1]`
/// index `col_lids`/`weights` for row `r`.
#[derive(Clone, Debug, Default)]
pub struct CrsMatrix {
    pub row_offsets: Vec<usize>,
    pub col_lids: Vec<usize>,
    pub weights: Vec<f64>,
}

impl CrsMatrix {
    #[inline]
    pub fn num_rows(&self) -> usize {
        self.row_offsets.len().saturating_sub(1)
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.weights.len()
    }

    /// Structural validity: monotone offsets ending at nnz, column ids
    /// within the source-local range.
    pub fn validate(&self, num_src_dofs: usize) -> Result<(), RemapError> {
        if self.row_offsets.first() != Some(&0) {
            return Err(RemapError::TripletInconsistency {
                context: "row offsets start",
                expected: 0,
                got: self.row_offsets.first().copied().unwrap_or(usize::MAX),
            });
        }
        for w in self.row_offsets.windows(2) {
            if w[1] < w[0] {
                return Err(RemapError::TripletInconsistency {
                    context: "row offsets monotonicity",
                    expected: w[0],
                    got: w[1],
                });
            }
        }
        let end = *self.row_offsets.last().expect("offsets non-empty");
        if end != self.nnz() {
            return Err(RemapError::TripletInconsistency {
                context: "row offsets end",
                expected: self.nnz(),
                got: end,
            });
        }
        if let Some(&bad) = self.col_lids.iter().find(|&&c| c >= num_src_dofs) {
            return Err(RemapError::TripletInconsistency {
                context: "column local id range",
                expected: num_src_dofs,
                got: bad,
            });
        }
        Ok(())
    }
}

/// Read the held triplets and build the overlapped target grid plus the
/// local CRS matrix. An empty assignment is legal and yields an empty grid.
pub(crate) fn build_overlapped_crs(
    src_grid: &PointGrid,
    reader: &mut MapFileReader,
    triplet_gids: &[u64],
) -> Result<(PointGrid, CrsMatrix), RemapError> {
    let nnz = triplet_gids.len();
    let rows_file = reader.read_i32_at("row", triplet_gids)?;
    let cols_file = reader.read_i32_at("col", triplet_gids)?;
    let weights_file = reader.read_f64_at("S", triplet_gids)?;

    // File gids are 1-based.
    let mut rows = Vec::with_capacity(nnz);
    let mut cols = Vec::with_capacity(nnz);
    for (&r, &c) in rows_file.iter().zip(&cols_file) {
        if r < 1 || c < 1 {
            return Err(RemapError::MapFileIo {
                path: reader.path().to_path_buf(),
                msg: format!("`row`/`col` entries must be 1-based positive gids, found ({r}, {c})"),
            });
        }
        rows.push((r - 1) as u64);
        cols.push((c - 1) as u64);
    }

    let ov_gids: Vec<u64> = rows.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let ov_grid = PointGrid::new("ov_tgt_grid", ov_gids, src_grid.num_levels())?;

    // Sort the index set instead of the triplet arrays; stable, so the held
    // order within a row survives.
    let mut perm: Vec<usize> = (0..nnz).collect();
    perm.sort_by_key(|&i| rows[i]);

    let mut col_lids = Vec::with_capacity(nnz);
    let mut weights = Vec::with_capacity(nnz);
    for &i in &perm {
        col_lids.push(src_grid.lid_checked(cols[i])?);
        weights.push(weights_file[i]);
    }

    let nrows = ov_grid.num_local_dofs();
    let mut counts = vec![0usize; nrows];
    for &r in &rows {
        counts[ov_grid.lid_checked(r)?] += 1;
    }
    let mut row_offsets = vec![0usize; nrows + 1];
    for i in 0..nrows {
        row_offsets[i + 1] = row_offsets[i] + counts[i];
    }
    if row_offsets[nrows] != nnz {
        return Err(RemapError::TripletInconsistency {
            context: "row offsets end",
            expected: nnz,
            got: row_offsets[nrows],
        });
    }

    let crs = CrsMatrix {
        row_offsets,
        col_lids,
        weights,
    };
    crs.validate(src_grid.num_local_dofs())?;
    Ok((ov_grid, crs))
}
