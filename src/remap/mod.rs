//! The coarsening remapper: a parallel operator applying a precomputed
//! sparse map `y = A x` from a fine source point grid to a coarser target.
//!
//! Construction reads and redistributes the map file, builds the overlapped
//! target grid and the local CRS matrix, and derives the true target grid.
//! Fields are then registered and bound; closing registration with every
//! field bound finalizes the exchange plan (overlapped mirror fields,
//! buffers, persistent channels). After that, each [`remap`] call runs:
//!
//! 1. post receives, 2. local mat-vec per field, 3. pack, 4. post sends,
//! 5. wait receives, 6. zero targets and reduce, 7. wait sends.
//!
//! Receives are posted before compute so matching on the wire proceeds while
//! this rank is still busy. Summation across peers follows the plan's peer
//! enumeration order, not MPI arrival order, so results are reproducible.
//!
//! [`remap`]: CoarseningRemapper::remap

pub mod csr;
pub mod exchange;
pub mod matvec;
pub mod plan;
pub mod triplets;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::comm::{Communicator, RemapCommTags};
use crate::error::RemapError;
use crate::field::{Field, FieldLayout, PackWidth};
use crate::grid::PointGrid;
use crate::io::MapFileReader;

use csr::{build_overlapped_crs, CrsMatrix};
use matvec::local_mat_vec;
use plan::{build_exchange_plan, ExchangePlan};
use triplets::load_triplet_gids;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RegistrationState {
    Clean,
    Open,
    Closed,
}

impl RegistrationState {
    fn as_str(self) -> &'static str {
        match self {
            RegistrationState::Clean => "not started",
            RegistrationState::Open => "open",
            RegistrationState::Closed => "closed",
        }
    }
}

struct FieldSpec {
    name: String,
    layout: FieldLayout,
}

/// Distributed coarsening remapper over a communicator `C`.
///
/// The instance exclusively owns the overlapped target grid, the CRS arrays,
/// the exchange buffers and the persistent channels; source and target grids
/// are shared read-only. Concurrent `remap` calls on one instance are not
/// possible (`remap` takes `&mut self`).
pub struct CoarseningRemapper<C: Communicator> {
    comm: Arc<C>,
    tags: RemapCommTags,
    src_grid: Arc<PointGrid>,
    tgt_grid: Arc<PointGrid>,
    ov_tgt_grid: PointGrid,
    crs: CrsMatrix,

    state: RegistrationState,
    specs: Vec<FieldSpec>,
    src_fields: Vec<Option<Field>>,
    tgt_fields: Vec<Option<Field>>,
    ov_fields: Vec<Field>,
    num_bound: usize,
    plan: Option<ExchangePlan<C>>,
}

impl<C: Communicator> CoarseningRemapper<C> {
    /// Read the map file and build the distributed operator skeleton.
    ///
    /// `src_grid` must be a unique point grid. The true target grid is
    /// derived from the map: the distinct row gids, partitioned so each has
    /// exactly one owner, inheriting the source grid's vertical levels.
    pub fn new(
        comm: Arc<C>,
        src_grid: Arc<PointGrid>,
        map_file: impl AsRef<Path>,
    ) -> Result<Self, RemapError> {
        Self::with_tags(comm, src_grid, map_file, RemapCommTags::default())
    }

    /// Like [`new`](Self::new) with an explicit tag block, for callers that
    /// run several remappers over one communicator.
    pub fn with_tags(
        comm: Arc<C>,
        src_grid: Arc<PointGrid>,
        map_file: impl AsRef<Path>,
        tags: RemapCommTags,
    ) -> Result<Self, RemapError> {
        if !src_grid.is_unique(&*comm, tags.gather)? {
            return Err(RemapError::InvalidSourceGrid(src_grid.name().to_string()));
        }

        let mut reader = MapFileReader::open(map_file)?;
        let triplet_gids = load_triplet_gids(&*comm, &src_grid, &mut reader, &tags)?;
        let (ov_tgt_grid, crs) = build_overlapped_crs(&src_grid, &mut reader, &triplet_gids)?;

        let tgt_gids = ov_tgt_grid.unique_gids(&*comm, tags.gather)?;
        let tgt_grid = Arc::new(PointGrid::new("tgt_grid", tgt_gids, src_grid.num_levels())?);

        Ok(Self {
            comm,
            tags,
            src_grid,
            tgt_grid,
            ov_tgt_grid,
            crs,
            state: RegistrationState::Clean,
            specs: Vec::new(),
            src_fields: Vec::new(),
            tgt_fields: Vec::new(),
            ov_fields: Vec::new(),
            num_bound: 0,
            plan: None,
        })
    }

    /// Open field registration.
    pub fn registration_begins(&mut self) -> Result<(), RemapError> {
        if self.state != RegistrationState::Clean {
            return Err(RemapError::InvalidRegistrationState {
                op: "begin registration",
                state: self.state.as_str(),
            });
        }
        self.state = RegistrationState::Open;
        Ok(())
    }

    /// Register one source/target field pair by shape; returns its index.
    /// The layout (sans column dimension) is shared by both sides.
    pub fn register_field(
        &mut self,
        name: impl Into<String>,
        layout: FieldLayout,
    ) -> Result<usize, RemapError> {
        if self.state != RegistrationState::Open {
            return Err(RemapError::InvalidRegistrationState {
                op: "register field",
                state: self.state.as_str(),
            });
        }
        self.specs.push(FieldSpec {
            name: name.into(),
            layout,
        });
        self.src_fields.push(None);
        self.tgt_fields.push(None);
        Ok(self.specs.len() - 1)
    }

    /// Bind the actual field storage for pair `i`. Once registration is
    /// closed and the last pair is bound, the exchange plan is finalized and
    /// further changes are rejected.
    pub fn bind_field(&mut self, i: usize, src: Field, tgt: Field) -> Result<(), RemapError> {
        if self.state == RegistrationState::Clean || self.plan.is_some() {
            return Err(RemapError::InvalidRegistrationState {
                op: "bind field",
                state: if self.plan.is_some() {
                    "finalized"
                } else {
                    self.state.as_str()
                },
            });
        }
        let spec = self.specs.get(i).ok_or(RemapError::FieldIndexOutOfBounds {
            index: i,
            len: self.specs.len(),
        })?;
        if src.layout() != spec.layout || tgt.layout() != spec.layout {
            return Err(RemapError::UnsupportedLayout {
                field: spec.name.clone(),
                src: src.layout().to_string(),
                tgt: tgt.layout().to_string(),
            });
        }
        if src.ncols() != self.src_grid.num_local_dofs() {
            return Err(RemapError::SizeMismatch {
                context: "source field columns",
                expected: self.src_grid.num_local_dofs(),
                got: src.ncols(),
            });
        }
        if tgt.ncols() != self.tgt_grid.num_local_dofs() {
            return Err(RemapError::SizeMismatch {
                context: "target field columns",
                expected: self.tgt_grid.num_local_dofs(),
                got: tgt.ncols(),
            });
        }

        let newly_bound = self.src_fields[i].is_none();
        self.src_fields[i] = Some(src);
        self.tgt_fields[i] = Some(tgt);
        if newly_bound {
            self.num_bound += 1;
        }

        if self.state == RegistrationState::Closed && self.num_bound == self.specs.len() {
            self.finalize()?;
        }
        Ok(())
    }

    /// Close registration. If every pair is already bound, finalize the plan.
    pub fn registration_ends(&mut self) -> Result<(), RemapError> {
        if self.state != RegistrationState::Open {
            return Err(RemapError::InvalidRegistrationState {
                op: "end registration",
                state: self.state.as_str(),
            });
        }
        self.state = RegistrationState::Closed;
        if self.num_bound == self.specs.len() {
            self.finalize()?;
        }
        Ok(())
    }

    /// Allocate overlapped mirror fields (source pack width, target layout)
    /// and compute the exchange plan.
    fn finalize(&mut self) -> Result<(), RemapError> {
        let ov_cols = self.ov_tgt_grid.num_local_dofs();
        self.ov_fields.reserve(self.specs.len());
        for (i, spec) in self.specs.iter().enumerate() {
            let src = self.src_fields[i].as_ref().expect("all fields bound");
            self.ov_fields.push(Field::new(
                format!("{}_ov", spec.name),
                spec.layout,
                ov_cols,
                src.pack(),
            )?);
        }
        let col_sizes: Vec<usize> = self.specs.iter().map(|s| s.layout.col_size()).collect();
        self.plan = Some(build_exchange_plan(
            &*self.comm,
            &self.ov_tgt_grid,
            &self.tgt_grid,
            &col_sizes,
            &self.tags,
        )?);
        Ok(())
    }

    /// Perform one remap. Only the forward (source -> target) direction
    /// exists for a coarsening map.
    pub fn remap(&mut self, forward: bool) -> Result<(), RemapError> {
        if !forward {
            return Err(RemapError::UnsupportedDirection);
        }
        let plan = self.plan.as_mut().ok_or(RemapError::RegistrationIncomplete)?;

        // Fire the receives first: peers that finish packing early can match
        // on the wire while we are still computing.
        plan.start_recvs()?;

        for i in 0..self.specs.len() {
            let x = self.src_fields[i].as_ref().expect("all fields bound");
            local_mat_vec(&self.crs, x, &mut self.ov_fields[i])?;
        }

        plan.pack(&self.ov_fields)?;
        plan.start_sends()?;

        plan.wait_recvs()?;
        for (i, slot) in self.tgt_fields.iter_mut().enumerate() {
            let tgt = slot.as_mut().expect("all fields bound");
            tgt.fill(0.0);
            plan.unpack_field(i, tgt)?;
        }

        plan.wait_sends()?;
        Ok(())
    }

    // ---- queries ----

    /// The derived target grid: distinct map rows, one owner per gid,
    /// vertical levels inherited from the source grid.
    pub fn get_tgt_grid(&self) -> Arc<PointGrid> {
        Arc::clone(&self.tgt_grid)
    }

    pub fn get_src_grid(&self) -> Arc<PointGrid> {
        Arc::clone(&self.src_grid)
    }

    /// The overlapped target grid (this rank's distinct touched rows).
    pub fn ov_tgt_grid(&self) -> &PointGrid {
        &self.ov_tgt_grid
    }

    /// The local CRS matrix over overlapped rows and source-local columns.
    pub fn crs(&self) -> &CrsMatrix {
        &self.crs
    }

    pub fn local_nnz(&self) -> usize {
        self.crs.nnz()
    }

    pub fn num_fields(&self) -> usize {
        self.specs.len()
    }

    pub fn src_field(&self, i: usize) -> Result<&Field, RemapError> {
        self.bound_field(&self.src_fields, i)
    }

    /// Mutable access to a bound source field, for filling inputs.
    pub fn src_field_mut(&mut self, i: usize) -> Result<&mut Field, RemapError> {
        let len = self.specs.len();
        self.src_fields
            .get_mut(i)
            .and_then(|s| s.as_mut())
            .ok_or(RemapError::FieldIndexOutOfBounds { index: i, len })
    }

    pub fn tgt_field(&self, i: usize) -> Result<&Field, RemapError> {
        self.bound_field(&self.tgt_fields, i)
    }

    fn bound_field<'a>(
        &self,
        fields: &'a [Option<Field>],
        i: usize,
    ) -> Result<&'a Field, RemapError> {
        fields
            .get(i)
            .and_then(|s| s.as_ref())
            .ok_or(RemapError::FieldIndexOutOfBounds {
                index: i,
                len: self.specs.len(),
            })
    }

    /// Allocate a zeroed field shaped for the source grid.
    pub fn create_src_field(
        &self,
        name: impl Into<String>,
        layout: FieldLayout,
        pack: PackWidth,
    ) -> Result<Field, RemapError> {
        Field::new(name, layout, self.src_grid.num_local_dofs(), pack)
    }

    /// Allocate a zeroed field shaped for the target grid.
    pub fn create_tgt_field(
        &self,
        name: impl Into<String>,
        layout: FieldLayout,
        pack: PackWidth,
    ) -> Result<Field, RemapError> {
        Field::new(name, layout, self.tgt_grid.num_local_dofs(), pack)
    }

    /// Number of persistent send channels (nonempty outgoing peers).
    pub fn num_send_channels(&self) -> Result<usize, RemapError> {
        Ok(self
            .plan
            .as_ref()
            .ok_or(RemapError::RegistrationIncomplete)?
            .num_send_channels())
    }

    /// Number of persistent recv channels (nonempty incoming peers).
    pub fn num_recv_channels(&self) -> Result<usize, RemapError> {
        Ok(self
            .plan
            .as_ref()
            .ok_or(RemapError::RegistrationIncomplete)?
            .num_recv_channels())
    }

    /// Outgoing gid lists by destination rank, in wire order.
    pub fn send_gid_lists(&self) -> Result<&BTreeMap<usize, Vec<u64>>, RemapError> {
        Ok(self
            .plan
            .as_ref()
            .ok_or(RemapError::RegistrationIncomplete)?
            .send_gid_lists())
    }

    /// Incoming gid lists by source rank, in wire order.
    pub fn recv_gid_lists(&self) -> Result<&BTreeMap<usize, Vec<u64>>, RemapError> {
        Ok(self
            .plan
            .as_ref()
            .ok_or(RemapError::RegistrationIncomplete)?
            .recv_gid_lists())
    }
}
