//! Local sparse mat-vec: apply the CRS to one field, producing the partial
//! result on the overlapped target grid.
//!
//! Rows are independent, so the kernel runs row-parallel; within a row the
//! contributions sum in ascending `k` order, which keeps results
//! reproducible. The first contribution to a row *assigns* instead of
//! accumulating, so no separate zero pass over the output is needed.
//!
//! Dispatch picks the widest pack width `{16, 8, 4, 1}` whose lanes tile the
//! padded innermost dimension of both operands; the inner loops then move
//! whole pack-width groups, padding lanes included.

use rayon::prelude::*;

use crate::error::RemapError;
use crate::field::{Field, FieldLayout, PackWidth};
use crate::remap::csr::CrsMatrix;

/// `y = A x` with `x` on the source grid and `y` on the overlapped target.
pub(crate) fn local_mat_vec(crs: &CrsMatrix, x: &Field, y: &mut Field) -> Result<(), RemapError> {
    if x.layout() != y.layout() {
        return Err(RemapError::UnsupportedLayout {
            field: y.name().to_string(),
            src: x.layout().to_string(),
            tgt: y.layout().to_string(),
        });
    }
    if y.ncols() != crs.num_rows() {
        return Err(RemapError::SizeMismatch {
            context: "mat-vec output columns",
            expected: crs.num_rows(),
            got: y.ncols(),
        });
    }
    match x.compatible_pack(y) {
        PackWidth::Sixteen => apply::<16>(crs, x, y),
        PackWidth::Eight => apply::<8>(crs, x, y),
        PackWidth::Four => apply::<4>(crs, x, y),
        PackWidth::One => apply::<1>(crs, x, y),
    }
    Ok(())
}

fn apply<const P: usize>(crs: &CrsMatrix, x: &Field, y: &mut Field) {
    let ncomp = match x.layout() {
        FieldLayout::Vector3D { ncomp, .. } => ncomp,
        _ => 1,
    };
    // Lanes touched per component: the logical innermost extent rounded up to
    // a whole number of packs. Both allocations cover this range.
    let lanes = (x.layout().inner_dim() + P - 1) / P * P;
    let x_inner = x.inner_alloc();
    let x_stride = x.alloc_col_size();
    let y_inner = y.inner_alloc();
    let y_stride = y.alloc_col_size();

    let xd = x.data();
    let offsets = &crs.row_offsets;
    let col_lids = &crs.col_lids;
    let weights = &crs.weights;

    y.data_mut()
        .par_chunks_mut(y_stride)
        .enumerate()
        .for_each(|(row, ycol)| {
            let beg = offsets[row];
            let end = offsets[row + 1];
            debug_assert!(beg < end, "overlapped rows always have an entry");
            for j in 0..ncomp {
                let yj = &mut ycol[j * y_inner..j * y_inner + lanes];
                let x0 = &xd[col_lids[beg] * x_stride + j * x_inner..][..lanes];
                let w0 = weights[beg];
                for (yv, xv) in yj.chunks_exact_mut(P).zip(x0.chunks_exact(P)) {
                    for l in 0..P {
                        yv[l] = w0 * xv[l];
                    }
                }
                for k in beg + 1..end {
                    let xk = &xd[col_lids[k] * x_stride + j * x_inner..][..lanes];
                    let wk = weights[k];
                    for (yv, xv) in yj.chunks_exact_mut(P).zip(xk.chunks_exact(P)) {
                        for l in 0..P {
                            yv[l] += wk * xv[l];
                        }
                    }
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two rows over four source columns:
    //   y[0] = 0.5 x[1] + 0.5 x[2],  y[1] = 2 x[3]
    fn sample_crs() -> CrsMatrix {
        CrsMatrix {
            row_offsets: vec![0, 2, 3],
            col_lids: vec![1, 2, 3],
            weights: vec![0.5, 0.5, 2.0],
        }
    }

    #[test]
    fn rank1_weighted_sums() {
        let crs = sample_crs();
        let mut x = Field::new("x", FieldLayout::Scalar2D, 4, PackWidth::One).unwrap();
        for i in 0..4 {
            x.set1(i, i as f64);
        }
        let mut y = Field::new("y", FieldLayout::Scalar2D, 2, PackWidth::One).unwrap();
        // stale values must be overwritten, not accumulated into
        y.fill(99.0);
        local_mat_vec(&crs, &x, &mut y).unwrap();
        assert_eq!(y.get1(0), 1.5);
        assert_eq!(y.get1(1), 6.0);
    }

    #[test]
    fn packed_and_unpacked_agree() {
        let crs = sample_crs();
        let nlevs = 8;
        let mut x1 = Field::new("x1", FieldLayout::Scalar3D { nlevs }, 4, PackWidth::One).unwrap();
        let mut x8 = Field::new("x8", FieldLayout::Scalar3D { nlevs }, 4, PackWidth::Eight).unwrap();
        for i in 0..4 {
            for k in 0..nlevs {
                let v = (i * nlevs + k) as f64;
                x1.set2(i, k, v);
                x8.set2(i, k, v);
            }
        }
        let mut y1 = Field::new("y1", FieldLayout::Scalar3D { nlevs }, 2, PackWidth::One).unwrap();
        let mut y8 = Field::new("y8", FieldLayout::Scalar3D { nlevs }, 2, PackWidth::Eight).unwrap();
        assert_eq!(x8.compatible_pack(&y8), PackWidth::Eight);
        local_mat_vec(&crs, &x1, &mut y1).unwrap();
        local_mat_vec(&crs, &x8, &mut y8).unwrap();
        for r in 0..2 {
            for k in 0..nlevs {
                assert_eq!(y1.get2(r, k), y8.get2(r, k));
            }
        }
    }

    #[test]
    fn vector3d_per_component() {
        let crs = sample_crs();
        let (ncomp, nlevs) = (2, 4);
        let mut x = Field::new(
            "x",
            FieldLayout::Vector3D { ncomp, nlevs },
            4,
            PackWidth::Four,
        )
        .unwrap();
        for i in 0..4 {
            for j in 0..ncomp {
                for k in 0..nlevs {
                    x.set3(i, j, k, (i * 100 + j * 10 + k) as f64);
                }
            }
        }
        let mut y = Field::new(
            "y",
            FieldLayout::Vector3D { ncomp, nlevs },
            2,
            PackWidth::Four,
        )
        .unwrap();
        local_mat_vec(&crs, &x, &mut y).unwrap();
        for j in 0..ncomp {
            for k in 0..nlevs {
                let expect0 = 0.5 * (100 + j * 10 + k) as f64 + 0.5 * (200 + j * 10 + k) as f64;
                let expect1 = 2.0 * (300 + j * 10 + k) as f64;
                assert_eq!(y.get3(0, j, k), expect0);
                assert_eq!(y.get3(1, j, k), expect1);
            }
        }
    }

    #[test]
    fn operand_shape_mismatch_is_an_error() {
        let crs = sample_crs();
        let x = Field::new("x", FieldLayout::Scalar2D, 4, PackWidth::One).unwrap();
        let mut y = Field::new("y", FieldLayout::Vector2D { ncomp: 2 }, 2, PackWidth::One).unwrap();
        assert!(local_mat_vec(&crs, &x, &mut y).is_err());

        let mut y_short = Field::new("y", FieldLayout::Scalar2D, 1, PackWidth::One).unwrap();
        assert!(matches!(
            local_mat_vec(&crs, &x, &mut y_short),
            Err(RemapError::SizeMismatch { .. })
        ));
    }
}
