//! Single-rank scenarios: two-to-one averaging and the forbidden reverse
//! direction. With one rank the exchange still runs, as a self-send.

mod util;

use coarse_remap::field::{FieldLayout, PackWidth};
use util::*;

#[test]
fn two_to_one_averaging() {
    let ntgt = 5;
    let path = map_path("s1_avg");
    write_averaging_map(&path, ntgt);

    let mut results = run_ranks(1, |comm| {
        let src_grid = block_src_grid(0, 10, 20);
        let mut remap = build_remapper(comm, src_grid, &path, 100);

        assert_eq!(remap.local_nnz(), 2 * ntgt);
        let tgt_grid = remap.get_tgt_grid();
        assert_eq!(tgt_grid.num_local_dofs(), ntgt);
        assert_eq!(tgt_grid.num_levels(), 20);

        remap.registration_begins().unwrap();
        let i = remap.register_field("q", FieldLayout::Scalar2D).unwrap();
        let mut src = remap
            .create_src_field("q", FieldLayout::Scalar2D, PackWidth::One)
            .unwrap();
        let src_gids: Vec<u64> = remap.get_src_grid().gids().to_vec();
        for (lid, &g) in src_gids.iter().enumerate() {
            src.set1(lid, g as f64);
        }
        let tgt = remap
            .create_tgt_field("q", FieldLayout::Scalar2D, PackWidth::One)
            .unwrap();
        remap.bind_field(i, src, tgt).unwrap();
        remap.registration_ends().unwrap();

        // one self peer on each side
        assert_eq!(remap.num_send_channels().unwrap(), 1);
        assert_eq!(remap.num_recv_channels().unwrap(), 1);

        remap.remap(true).unwrap();

        let y = remap.tgt_field(i).unwrap();
        tgt_grid
            .gids()
            .iter()
            .enumerate()
            .map(|(lid, &g)| (g, y.get1(lid)))
            .collect::<Vec<_>>()
    });
    std::fs::remove_file(&path).ok();

    for (g, got) in results.remove(0) {
        assert_eq!(got, averaged(g, ntgt), "target gid {g}");
    }
}

#[test]
fn reverse_direction_is_rejected() {
    let ntgt = 3;
    let path = map_path("s6_reverse");
    write_averaging_map(&path, ntgt);

    run_ranks(1, |comm| {
        let src_grid = block_src_grid(0, 6, 4);
        let mut remap = build_remapper(comm, src_grid, &path, 120);
        remap.registration_begins().unwrap();
        let i = remap.register_field("q", FieldLayout::Scalar2D).unwrap();
        let src = remap
            .create_src_field("q", FieldLayout::Scalar2D, PackWidth::One)
            .unwrap();
        let tgt = remap
            .create_tgt_field("q", FieldLayout::Scalar2D, PackWidth::One)
            .unwrap();
        remap.bind_field(i, src, tgt).unwrap();
        remap.registration_ends().unwrap();

        assert!(matches!(
            remap.remap(false),
            Err(coarse_remap::RemapError::UnsupportedDirection)
        ));
        // the failed call must not poison the instance
        remap.remap(true).unwrap();
    });
    std::fs::remove_file(&path).ok();
}
