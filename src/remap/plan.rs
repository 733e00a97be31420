//! One-time exchange planning: route every overlapped-target row to the rank
//! that owns it on the true target grid.
//!
//! The plan is symmetric by construction: the send side groups overlapped
//! rows by owner rank, and the receive side is derived from the same dual
//! exchange the triplet loader uses, so rank A's send list to B and B's
//! receive list from A enumerate the same gids in the same order.
//!
//! Buffers are laid out peer-major, field-minor: all fields for peer 0, then
//! all fields for peer 1, and so on. One persistent channel per nonempty
//! peer (self included) is created here and freed only on drop.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::comm::{Communicator, RecvChannel, RemapCommTags, SendChannel};
use crate::error::RemapError;
use crate::grid::PointGrid;
use crate::remap::triplets::exchange_dual_gids;

pub(crate) struct ExchangePlan<C: Communicator> {
    /// `(ov_lid, owner_rank)` sorted by owner rank.
    pub send_lids_pids: Vec<(usize, usize)>,
    /// Prefix table into `send_lids_pids`, length `size + 1`.
    pub send_pid_lids_start: Vec<usize>,
    /// Send-buffer offset of `[field][pid]`.
    pub send_f_pid_offsets: Vec<Vec<usize>>,
    /// `(source_rank, position_in_that_peer's_gid_list)` per target lid.
    pub recv_lids_pidpos: Vec<(usize, usize)>,
    pub recv_lids_beg: Vec<usize>,
    pub recv_lids_end: Vec<usize>,
    /// Recv-buffer offset of `[field][pid]`.
    pub recv_f_pid_offsets: Vec<Vec<usize>>,

    pub col_sizes: Vec<usize>,
    pub stride: usize,

    pub send_buf: Vec<f64>,
    pub recv_buf: Vec<f64>,

    send_channels: Vec<(Range<usize>, C::SendChannel)>,
    recv_channels: Vec<(Range<usize>, C::RecvChannel)>,

    // Kept for diagnostics and plan-symmetry checks.
    send_gids: BTreeMap<usize, Vec<u64>>,
    recv_gids: BTreeMap<usize, Vec<u64>>,
}

pub(crate) fn build_exchange_plan<C: Communicator>(
    comm: &C,
    ov_grid: &PointGrid,
    tgt_grid: &PointGrid,
    col_sizes: &[usize],
    tags: &RemapCommTags,
) -> Result<ExchangePlan<C>, RemapError> {
    let size = comm.size();
    let nfields = col_sizes.len();
    let stride: usize = col_sizes.iter().sum();

    // ---- send side ----
    let owners = tgt_grid.get_owners(comm, ov_grid.gids(), tags.gather)?;
    let mut pid2lids: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut send_gids: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for (lid, &pid) in owners.iter().enumerate() {
        pid2lids.entry(pid).or_default().push(lid);
        send_gids.entry(pid).or_default().push(ov_grid.gid(lid));
    }

    let num_ov = ov_grid.num_local_dofs();
    let mut send_lids_pids = Vec::with_capacity(num_ov);
    let mut send_pid_lids_start = vec![0usize; size + 1];
    for pid in 0..size {
        send_pid_lids_start[pid] = send_lids_pids.len();
        if let Some(lids) = pid2lids.get(&pid) {
            for &lid in lids {
                send_lids_pids.push((lid, pid));
            }
        }
    }
    send_pid_lids_start[size] = send_lids_pids.len();
    if send_lids_pids.len() != num_ov {
        return Err(RemapError::TripletInconsistency {
            context: "send slot count",
            expected: num_ov,
            got: send_lids_pids.len(),
        });
    }

    let mut send_f_pid_offsets = vec![vec![0usize; size]; nfields];
    let mut send_pid_offsets = vec![0usize; size + 1];
    let mut pos = 0usize;
    for pid in 0..size {
        send_pid_offsets[pid] = pos;
        let n = pid2lids.get(&pid).map_or(0, |v| v.len());
        for (f, &cs) in col_sizes.iter().enumerate() {
            send_f_pid_offsets[f][pid] = pos;
            pos += cs * n;
        }
    }
    send_pid_offsets[size] = pos;
    if pos != num_ov * stride {
        return Err(RemapError::TripletInconsistency {
            context: "send buffer extent",
            expected: num_ov * stride,
            got: pos,
        });
    }
    let send_buf = vec![0.0; pos];

    let mut send_channels = Vec::new();
    for (&pid, lids) in &pid2lids {
        let n = lids.len() * stride;
        if n == 0 {
            continue;
        }
        let beg = send_pid_offsets[pid];
        send_channels.push((beg..beg + n, comm.send_init(pid, tags.payload, n)?));
    }

    // ---- recv side ----
    let num_tgt = tgt_grid.num_local_dofs();
    let recv_gids = exchange_dual_gids(comm, &send_gids, tags)?;

    let mut lid_buckets: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_tgt];
    let mut num_recv_gids = 0usize;
    for (&pid, gids) in &recv_gids {
        for (pos_in_list, &g) in gids.iter().enumerate() {
            lid_buckets[tgt_grid.lid_checked(g)?].push((pid, pos_in_list));
        }
        num_recv_gids += gids.len();
    }

    let mut recv_lids_pidpos = Vec::with_capacity(num_recv_gids);
    let mut recv_lids_beg = vec![0usize; num_tgt];
    let mut recv_lids_end = vec![0usize; num_tgt];
    for (lid, bucket) in lid_buckets.iter().enumerate() {
        recv_lids_beg[lid] = recv_lids_pidpos.len();
        recv_lids_pidpos.extend(bucket.iter().copied());
        recv_lids_end[lid] = recv_lids_pidpos.len();
    }

    let mut recv_pid_counts = vec![0usize; size];
    for (&pid, gids) in &recv_gids {
        recv_pid_counts[pid] = gids.len();
    }
    let mut recv_f_pid_offsets = vec![vec![0usize; size]; nfields];
    let mut recv_pid_offsets = vec![0usize; size + 1];
    let mut pos = 0usize;
    for pid in 0..size {
        recv_pid_offsets[pid] = pos;
        for (f, &cs) in col_sizes.iter().enumerate() {
            recv_f_pid_offsets[f][pid] = pos;
            pos += cs * recv_pid_counts[pid];
        }
    }
    recv_pid_offsets[size] = pos;
    if pos != num_recv_gids * stride {
        return Err(RemapError::TripletInconsistency {
            context: "recv buffer extent",
            expected: num_recv_gids * stride,
            got: pos,
        });
    }
    let recv_buf = vec![0.0; pos];

    let mut recv_channels = Vec::new();
    for pid in 0..size {
        let n = recv_pid_counts[pid] * stride;
        if n == 0 {
            continue;
        }
        let beg = recv_pid_offsets[pid];
        recv_channels.push((beg..beg + n, comm.recv_init(pid, tags.payload, n)?));
    }

    let plan = ExchangePlan {
        send_lids_pids,
        send_pid_lids_start,
        send_f_pid_offsets,
        recv_lids_pidpos,
        recv_lids_beg,
        recv_lids_end,
        recv_f_pid_offsets,
        col_sizes: col_sizes.to_vec(),
        stride,
        send_buf,
        recv_buf,
        send_channels,
        recv_channels,
        send_gids,
        recv_gids,
    };
    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    plan.assert_local_invariants();
    Ok(plan)
}

impl<C: Communicator> ExchangePlan<C> {
    /// Post all persistent receives.
    pub fn start_recvs(&mut self) -> Result<(), RemapError> {
        for (_, ch) in &mut self.recv_channels {
            ch.start()?;
        }
        Ok(())
    }

    /// Wait for all receives and land the payloads in the recv buffer.
    pub fn wait_recvs(&mut self) -> Result<(), RemapError> {
        for (range, ch) in &mut self.recv_channels {
            ch.wait(&mut self.recv_buf[range.clone()])?;
        }
        Ok(())
    }

    /// Post all persistent sends from the packed send buffer.
    pub fn start_sends(&mut self) -> Result<(), RemapError> {
        for (range, ch) in &mut self.send_channels {
            ch.start(&self.send_buf[range.clone()])?;
        }
        Ok(())
    }

    /// Wait for all sends to complete.
    pub fn wait_sends(&mut self) -> Result<(), RemapError> {
        for (_, ch) in &mut self.send_channels {
            ch.wait()?;
        }
        Ok(())
    }

    pub fn num_send_channels(&self) -> usize {
        self.send_channels.len()
    }

    pub fn num_recv_channels(&self) -> usize {
        self.recv_channels.len()
    }

    /// Gids this rank sends, grouped by destination rank, in wire order.
    pub fn send_gid_lists(&self) -> &BTreeMap<usize, Vec<u64>> {
        &self.send_gids
    }

    /// Gids this rank receives, grouped by source rank, in wire order.
    pub fn recv_gid_lists(&self) -> &BTreeMap<usize, Vec<u64>> {
        &self.recv_gids
    }

    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    fn assert_local_invariants(&self) {
        for w in self.send_pid_lids_start.windows(2) {
            debug_assert!(w[0] <= w[1]);
        }
        for (beg, end) in self.recv_lids_beg.iter().zip(&self.recv_lids_end) {
            debug_assert!(beg <= end);
            debug_assert!(*end <= self.recv_lids_pidpos.len());
        }
        let total: usize = self.recv_gids.values().map(|v| v.len()).sum();
        debug_assert_eq!(total, self.recv_lids_pidpos.len());
    }
}
