//! Gather/scatter between overlapped-target fields and the exchange buffers.
//!
//! A column travels as its `col_size` logical scalars, component-major and
//! level-minor, with padding lanes stripped; packer and unpacker agree on
//! that layout. Packing parallelizes over peers (their buffer regions are
//! contiguous and disjoint); unpacking parallelizes over target columns,
//! accumulating peer contributions in ascending peer order.

use rayon::prelude::*;

use crate::comm::Communicator;
use crate::error::RemapError;
use crate::field::{Field, FieldLayout};
use crate::remap::plan::ExchangePlan;

impl<C: Communicator> ExchangePlan<C> {
    /// Gather every overlapped column into the send buffer, by (peer, field).
    pub fn pack(&mut self, ov_fields: &[Field]) -> Result<(), RemapError> {
        if ov_fields.len() != self.col_sizes.len() {
            return Err(RemapError::SizeMismatch {
                context: "packed field count",
                expected: self.col_sizes.len(),
                got: ov_fields.len(),
            });
        }

        let size = self.send_pid_lids_start.len() - 1;
        let stride = self.stride;
        let col_sizes = &self.col_sizes;
        let send_lids_pids = &self.send_lids_pids;
        let starts = &self.send_pid_lids_start;

        // Peer regions are contiguous in the buffer; split them off so each
        // can be filled independently.
        let mut parts: Vec<(usize, &mut [f64])> = Vec::with_capacity(size);
        let mut tail = self.send_buf.as_mut_slice();
        for pid in 0..size {
            let len = (starts[pid + 1] - starts[pid]) * stride;
            let (head, rest) = tail.split_at_mut(len);
            parts.push((pid, head));
            tail = rest;
        }

        parts.into_par_iter().for_each(|(pid, part)| {
            let lid_beg = starts[pid];
            let lid_end = starts[pid + 1];
            let n = lid_end - lid_beg;
            let mut off = 0usize;
            for (field, &cs) in ov_fields.iter().zip(col_sizes) {
                for slot in lid_beg..lid_end {
                    let (lid, slot_pid) = send_lids_pids[slot];
                    debug_assert_eq!(slot_pid, pid);
                    let lidpos = slot - lid_beg;
                    read_column(field, lid, &mut part[off + lidpos * cs..off + (lidpos + 1) * cs]);
                }
                off += cs * n;
            }
        });
        Ok(())
    }

    /// Scatter every received contribution of field `f` into `tgt`,
    /// accumulating. The caller zeroes `tgt` first.
    pub fn unpack_field(&self, f: usize, tgt: &mut Field) -> Result<(), RemapError> {
        let cs = *self
            .col_sizes
            .get(f)
            .ok_or(RemapError::FieldIndexOutOfBounds {
                index: f,
                len: self.col_sizes.len(),
            })?;
        if tgt.col_size() != cs {
            return Err(RemapError::SizeMismatch {
                context: "unpacked column size",
                expected: cs,
                got: tgt.col_size(),
            });
        }
        if tgt.ncols() != self.recv_lids_beg.len() {
            return Err(RemapError::SizeMismatch {
                context: "unpacked target columns",
                expected: self.recv_lids_beg.len(),
                got: tgt.ncols(),
            });
        }

        let layout = tgt.layout();
        let inner_alloc = tgt.inner_alloc();
        let col_stride = tgt.alloc_col_size();
        let buf = &self.recv_buf;
        let f_offsets = &self.recv_f_pid_offsets[f];
        let beg = &self.recv_lids_beg;
        let end = &self.recv_lids_end;
        let pidpos = &self.recv_lids_pidpos;

        tgt.data_mut()
            .par_chunks_mut(col_stride)
            .enumerate()
            .for_each(|(lid, col)| {
                for entry in &pidpos[beg[lid]..end[lid]] {
                    let (pid, lidpos) = *entry;
                    let src = &buf[f_offsets[pid] + lidpos * cs..][..cs];
                    add_column(layout, inner_alloc, col, src);
                }
            });
        Ok(())
    }
}

/// Serialize the logical entries of one allocated column.
fn read_column(field: &Field, lid: usize, out: &mut [f64]) {
    let col = field.col(lid);
    match field.layout() {
        FieldLayout::Scalar2D => out[0] = col[0],
        FieldLayout::Vector2D { ncomp } => out.copy_from_slice(&col[..ncomp]),
        FieldLayout::Scalar3D { nlevs } => out.copy_from_slice(&col[..nlevs]),
        FieldLayout::Vector3D { ncomp, nlevs } => {
            let inner = field.inner_alloc();
            for j in 0..ncomp {
                out[j * nlevs..(j + 1) * nlevs].copy_from_slice(&col[j * inner..j * inner + nlevs]);
            }
        }
    }
}

/// Accumulate serialized logical entries into one allocated column.
fn add_column(layout: FieldLayout, inner_alloc: usize, col: &mut [f64], src: &[f64]) {
    match layout {
        FieldLayout::Scalar2D => col[0] += src[0],
        FieldLayout::Vector2D { ncomp } => {
            for j in 0..ncomp {
                col[j] += src[j];
            }
        }
        FieldLayout::Scalar3D { nlevs } => {
            for k in 0..nlevs {
                col[k] += src[k];
            }
        }
        FieldLayout::Vector3D { ncomp, nlevs } => {
            for j in 0..ncomp {
                for k in 0..nlevs {
                    col[j * inner_alloc + k] += src[j * nlevs + k];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::PackWidth;

    #[test]
    fn column_roundtrip_strips_padding() {
        let mut f = Field::new(
            "f",
            FieldLayout::Vector3D { ncomp: 2, nlevs: 3 },
            1,
            PackWidth::Four,
        )
        .unwrap();
        for j in 0..2 {
            for k in 0..3 {
                f.set3(0, j, k, (10 * j + k) as f64);
            }
        }
        let mut wire = vec![0.0; 6];
        read_column(&f, 0, &mut wire);
        assert_eq!(wire, vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);

        let mut g = Field::new(
            "g",
            FieldLayout::Vector3D { ncomp: 2, nlevs: 3 },
            1,
            PackWidth::Four,
        )
        .unwrap();
        let inner = g.inner_alloc();
        add_column(g.layout(), inner, g.col_mut(0), &wire);
        add_column(g.layout(), inner, g.col_mut(0), &wire);
        for j in 0..2 {
            for k in 0..3 {
                assert_eq!(g.get3(0, j, k), 2.0 * (10 * j + k) as f64);
            }
        }
        // padding lanes untouched
        assert_eq!(g.col(0)[3], 0.0);
        assert_eq!(g.col(0)[7], 0.0);
    }
}
