#![allow(dead_code)]
//! Shared helpers for the multi-rank remap scenarios: synthetic map files
//! and a thread-per-rank harness over `RayonComm`.

use std::path::PathBuf;
use std::sync::Arc;

use coarse_remap::comm::{CommTag, RayonComm, RemapCommTags};
use coarse_remap::grid::PointGrid;
use coarse_remap::io::MapFileWriter;
use coarse_remap::remap::CoarseningRemapper;

/// Unique temp path per process and test.
pub fn map_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("coarse_remap_{}_{tag}.map", std::process::id()))
}

/// Write the two-to-one averaging map over `ngdofs_tgt` targets and
/// `2 * ngdofs_tgt` sources:
///
/// `y[k] = 0.25 x[k] + 0.75 x[k + ngdofs_tgt]`
pub fn write_averaging_map(path: &PathBuf, ngdofs_tgt: usize) {
    let mut row = Vec::with_capacity(2 * ngdofs_tgt);
    let mut col = Vec::with_capacity(2 * ngdofs_tgt);
    let mut s = Vec::with_capacity(2 * ngdofs_tgt);
    for k in 0..ngdofs_tgt as i32 {
        row.push(k + 1);
        col.push(k + 1);
        s.push(0.25);

        row.push(k + 1);
        col.push(k + 1 + ngdofs_tgt as i32);
        s.push(0.75);
    }
    let mut w = MapFileWriter::create(path);
    w.add_dim("n_a", 2 * ngdofs_tgt as u64)
        .add_dim("n_b", ngdofs_tgt as u64)
        .add_dim("n_s", 2 * ngdofs_tgt as u64)
        .add_var_i32("row", "n_s", &row)
        .add_var_i32("col", "n_s", &col)
        .add_var_f64("S", "n_s", &s);
    w.finish().unwrap();
}

/// Expected averaged value for target gid `g` when `x[i] = i`.
pub fn averaged(g: u64, ngdofs_tgt: usize) -> f64 {
    0.25 * g as f64 + 0.75 * (g as f64 + ngdofs_tgt as f64)
}

/// Run `f` once per rank, each rank on its own thread, and return the
/// results in rank order. Panics propagate.
pub fn run_ranks<T: Send>(size: usize, f: impl Fn(RayonComm) -> T + Sync) -> Vec<T> {
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = (0..size)
            .map(|rank| s.spawn(move || f(RayonComm::new(rank, size))))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Source grid for `rank`: the contiguous gid block
/// `[rank * nldofs, (rank + 1) * nldofs)`.
pub fn block_src_grid(rank: usize, nldofs: usize, num_levels: usize) -> Arc<PointGrid> {
    let gids = (rank as u64 * nldofs as u64..(rank as u64 + 1) * nldofs as u64).collect();
    Arc::new(PointGrid::new("src", gids, num_levels).unwrap())
}

/// Construct a remapper on `comm` with a dedicated tag base.
pub fn build_remapper(
    comm: RayonComm,
    src_grid: Arc<PointGrid>,
    path: &PathBuf,
    base_tag: u16,
) -> CoarseningRemapper<RayonComm> {
    CoarseningRemapper::with_tags(
        Arc::new(comm),
        src_grid,
        path,
        RemapCommTags::from_base(CommTag::new(base_tag)),
    )
    .unwrap()
}
