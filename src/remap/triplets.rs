//! Map-file triplet distribution: deciding which `(row, col, S)` triplets
//! each rank holds.
//!
//! The file stores triplets by independent rows with no relation to the
//! source decomposition, so ownership is established in two steps: every
//! rank reads a linear chunk of the `col` variable, asks the source grid who
//! owns each column, and then ships the *global triplet ids* to the column
//! owners through the dual exchange. After that, a rank holds exactly the
//! ids of the triplets whose columns it owns, and can read them in full.

use std::collections::BTreeMap;

use crate::comm::{Communicator, RemapCommTags, Wait};
use crate::error::RemapError;
use crate::grid::PointGrid;
use crate::io::MapFileReader;

/// Contiguous chunk of `[0, n)` owned by `rank` out of `size`; the remainder
/// is spread one element each over the leading ranks.
pub(crate) fn linear_chunk(n: u64, rank: usize, size: usize) -> (u64, u64) {
    let base = n / size as u64;
    let rem = n % size as u64;
    let r = rank as u64;
    let count = base + u64::from(r < rem);
    let offset = r * base + r.min(rem);
    (offset, count)
}

/// Learn the global triplet ids this rank must hold: those whose `col` gid
/// is locally owned on the source grid. Ids arrive grouped by sending peer
/// in ascending peer order.
pub(crate) fn load_triplet_gids<C: Communicator>(
    comm: &C,
    src_grid: &PointGrid,
    reader: &mut MapFileReader,
    tags: &RemapCommTags,
) -> Result<Vec<u64>, RemapError> {
    let n_s = reader.dim("n_s")?;
    let (offset, count) = linear_chunk(n_s, comm.rank(), comm.size());
    let cols = reader.read_i32("col", offset, count as usize)?;

    // File gids are 1-based.
    let mut cols0 = Vec::with_capacity(cols.len());
    for &c in &cols {
        if c < 1 {
            return Err(RemapError::MapFileIo {
                path: reader.path().to_path_buf(),
                msg: format!("`col` entries must be 1-based positive gids, found {c}"),
            });
        }
        cols0.push((c - 1) as u64);
    }

    let owners = src_grid.get_owners(comm, &cols0, tags.gather)?;
    let mut send: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for (i, &pid) in owners.iter().enumerate() {
        send.entry(pid).or_default().push(offset + i as u64);
    }

    let recv = exchange_dual_gids(comm, &send, tags)?;
    Ok(recv.into_values().flatten().collect())
}

/// The dual-exchange primitive.
///
/// Each rank knows who it must send gid lists to, but not who will send to
/// it. The inverse relation is discovered by all-gathering the outgoing peer
/// lists and scanning them for our own rank; after that, each peer pair
/// exchanges first a size, then the gid list itself. The self entry is moved
/// across directly instead of through the wire. Ordered maps keep peer
/// enumeration deterministic on every rank.
pub(crate) fn exchange_dual_gids<C: Communicator>(
    comm: &C,
    send: &BTreeMap<usize, Vec<u64>>,
    tags: &RemapCommTags,
) -> Result<BTreeMap<usize, Vec<u64>>, RemapError> {
    let my_rank = comm.rank();
    let me = my_rank as u64;

    // The self entry never touches the wire.
    let mut out: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    if let Some(own) = send.get(&my_rank) {
        out.insert(my_rank, own.clone());
    }

    let send_to: Vec<u64> = send.keys().map(|&p| p as u64).collect();
    let all_send_to = comm.all_gather_v_u64(&send_to, tags.gather)?;
    let recv_from: Vec<usize> = all_send_to
        .iter()
        .enumerate()
        .filter(|&(pid, peers)| pid != my_rank && peers.contains(&me))
        .map(|(pid, _)| pid)
        .collect();

    // Sizes: one u32 per peer pair.
    let mut size_recvs = Vec::with_capacity(recv_from.len());
    for &pid in &recv_from {
        let mut template = [0u8; 4];
        size_recvs.push((pid, comm.irecv(pid, tags.sizes.as_u16(), &mut template)));
    }
    let mut size_sends = Vec::with_capacity(send.len());
    for (&pid, gids) in send {
        if pid == my_rank {
            continue;
        }
        size_sends.push(comm.isend(pid, tags.sizes.as_u16(), &(gids.len() as u32).to_le_bytes()));
    }
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for (pid, h) in size_recvs {
        let data = h.wait().ok_or_else(|| RemapError::CommError {
            neighbor: pid,
            msg: "dual exchange: size recv returned no data".into(),
        })?;
        if data.len() != 4 {
            return Err(RemapError::CommError {
                neighbor: pid,
                msg: format!("dual exchange: expected 4 size bytes, got {}", data.len()),
            });
        }
        counts.insert(pid, u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize);
    }
    for s in size_sends {
        let _ = s.wait();
    }

    // Gid lists, lengths now known.
    let mut gid_recvs = Vec::with_capacity(counts.len());
    for (&pid, &n) in &counts {
        let mut template = vec![0u8; n * 8];
        gid_recvs.push((pid, n, comm.irecv(pid, tags.gids.as_u16(), &mut template)));
    }
    let mut gid_sends = Vec::with_capacity(send.len());
    for (&pid, gids) in send {
        if pid == my_rank {
            continue;
        }
        let mut bytes = Vec::with_capacity(gids.len() * 8);
        for g in gids {
            bytes.extend_from_slice(&g.to_le_bytes());
        }
        gid_sends.push(comm.isend(pid, tags.gids.as_u16(), &bytes));
    }
    for (pid, n, h) in gid_recvs {
        let data = h.wait().ok_or_else(|| RemapError::CommError {
            neighbor: pid,
            msg: "dual exchange: gid recv returned no data".into(),
        })?;
        if data.len() != n * 8 {
            return Err(RemapError::CommError {
                neighbor: pid,
                msg: format!("dual exchange: expected {} gid bytes, got {}", n * 8, data.len()),
            });
        }
        out.insert(
            pid,
            data.chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect(),
        );
    }
    for s in gid_sends {
        let _ = s.wait();
    }

    Ok(out)
}
