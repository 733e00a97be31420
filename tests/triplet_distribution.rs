//! Distribution invariants after construction: triplets are conserved
//! globally, columns are co-located with their owners, the CRS is valid,
//! and per-row weight totals survive the redistribution.

mod util;

use std::collections::BTreeMap;

use coarse_remap::comm::Communicator;
use coarse_remap::io::MapFileWriter;
use util::*;

const RANKS: usize = 3;
const NL_SRC: usize = 4;
const NG_SRC: usize = RANKS * NL_SRC; // 12
const NG_TGT: usize = 6;

/// Three entries per target row, with columns scattered across ranks.
fn scattered_map() -> (Vec<i32>, Vec<i32>, Vec<f64>) {
    let mut row = Vec::new();
    let mut col = Vec::new();
    let mut s = Vec::new();
    for k in 0..NG_TGT {
        for (c, w) in [(k, 0.2), (k + NG_TGT, 0.3), ((2 * k) % NG_SRC, 0.5)] {
            row.push(k as i32 + 1);
            col.push(c as i32 + 1);
            s.push(w);
        }
    }
    (row, col, s)
}

#[test]
fn distribution_invariants() {
    let (row, col, s) = scattered_map();
    let n_s = row.len();
    let path = map_path("dist_invariants");
    let mut w = MapFileWriter::create(&path);
    w.add_dim("n_a", NG_SRC as u64)
        .add_dim("n_b", NG_TGT as u64)
        .add_dim("n_s", n_s as u64)
        .add_var_i32("row", "n_s", &row)
        .add_var_i32("col", "n_s", &col)
        .add_var_f64("S", "n_s", &s);
    w.finish().unwrap();

    let results = run_ranks(RANKS, |comm| {
        let rank = comm.rank();
        let src_grid = block_src_grid(rank, NL_SRC, 0);
        let remap = build_remapper(comm, src_grid.clone(), &path, 260);

        let crs = remap.crs();
        // CRS validity: monotone offsets closed by nnz, columns in range.
        crs.validate(src_grid.num_local_dofs()).unwrap();

        // Column locality: every held column is owned here, so the source
        // gid recovered from each col lid must sit in this rank's block.
        let lo = (rank * NL_SRC) as u64;
        for &cl in &crs.col_lids {
            let gid = src_grid.gid(cl);
            assert!((lo..lo + NL_SRC as u64).contains(&gid));
        }

        // Per overlapped row, the local weight total.
        let mut row_weight: BTreeMap<u64, f64> = BTreeMap::new();
        for (r, &gid) in remap.ov_tgt_grid().gids().iter().enumerate() {
            let sum: f64 = crs.weights[crs.row_offsets[r]..crs.row_offsets[r + 1]]
                .iter()
                .sum();
            *row_weight.entry(gid).or_insert(0.0) += sum;
        }

        (remap.local_nnz(), row_weight)
    });
    std::fs::remove_file(&path).ok();

    // Conservation: no triplet lost or duplicated.
    let total_nnz: usize = results.iter().map(|(n, _)| n).sum();
    assert_eq!(total_nnz, n_s);

    // Reduction completeness: per-row weight totals across ranks match the
    // file exactly.
    let mut global: BTreeMap<u64, f64> = BTreeMap::new();
    for (_, per_rank) in &results {
        for (&gid, &w) in per_rank {
            *global.entry(gid).or_insert(0.0) += w;
        }
    }
    let mut expected: BTreeMap<u64, f64> = BTreeMap::new();
    for (&r, &w) in row.iter().zip(&s) {
        *expected.entry(r as u64 - 1).or_insert(0.0) += w;
    }
    assert_eq!(global.len(), expected.len());
    for (gid, want) in expected {
        let got = global[&gid];
        assert!(
            (got - want).abs() < 1e-12,
            "row {gid}: got {got}, want {want}"
        );
    }
}
