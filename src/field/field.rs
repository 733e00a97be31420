//! `Field`: a rank-1..3 tensor over a grid's local columns, stored as one
//! flat `Vec<f64>` with the innermost dimension padded to the pack width.
//!
//! Storage is column-major over dims: `[col][comp][level]` for 3-d vectors,
//! `[col][inner]` otherwise, where `inner` is the padded innermost extent.
//! Padding lanes are allocated zeroed and never observed through the logical
//! accessors; kernels may read and write them freely.

use crate::error::RemapError;
use crate::field::layout::{FieldLayout, PackWidth};

#[derive(Clone, Debug)]
pub struct Field {
    name: String,
    layout: FieldLayout,
    ncols: usize,
    pack: PackWidth,
    inner_alloc: usize,
    data: Vec<f64>,
}

impl Field {
    /// Allocate a zeroed field.
    ///
    /// 2-d scalar fields have nothing to pad along: any pack width other
    /// than 1 is rejected so that the column dimension stays dense.
    pub fn new(
        name: impl Into<String>,
        layout: FieldLayout,
        ncols: usize,
        pack: PackWidth,
    ) -> Result<Self, RemapError> {
        let name = name.into();
        if layout == FieldLayout::Scalar2D && pack != PackWidth::One {
            return Err(RemapError::UnsupportedPadding(name));
        }
        let inner_alloc = pack.round_up(layout.inner_dim());
        let ncomp = match layout {
            FieldLayout::Vector3D { ncomp, .. } => ncomp,
            _ => 1,
        };
        let data = vec![0.0; ncols * ncomp * inner_alloc];
        Ok(Self {
            name,
            layout,
            ncols,
            pack,
            inner_alloc,
            data,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn layout(&self) -> FieldLayout {
        self.layout
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    #[inline]
    pub fn pack(&self) -> PackWidth {
        self.pack
    }

    /// Logical scalars per column (padding excluded).
    #[inline]
    pub fn col_size(&self) -> usize {
        self.layout.col_size()
    }

    /// Padded extent of the innermost dimension.
    #[inline]
    pub fn inner_alloc(&self) -> usize {
        self.inner_alloc
    }

    /// Allocated scalars per column (padding included).
    #[inline]
    pub fn alloc_col_size(&self) -> usize {
        match self.layout {
            FieldLayout::Vector3D { ncomp, .. } => ncomp * self.inner_alloc,
            _ => self.inner_alloc,
        }
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// The allocated column at local id `lid`, padding included.
    #[inline]
    pub fn col(&self, lid: usize) -> &[f64] {
        let w = self.alloc_col_size();
        &self.data[lid * w..(lid + 1) * w]
    }

    #[inline]
    pub fn col_mut(&mut self, lid: usize) -> &mut [f64] {
        let w = self.alloc_col_size();
        &mut self.data[lid * w..(lid + 1) * w]
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    // Logical element accessors. `j` is the component for 2-d vectors and the
    // level for 3-d scalars; 3-d vectors take (component, level).

    #[inline]
    pub fn get1(&self, i: usize) -> f64 {
        debug_assert_eq!(self.layout.rank(), 1);
        self.data[i]
    }

    #[inline]
    pub fn set1(&mut self, i: usize, v: f64) {
        debug_assert_eq!(self.layout.rank(), 1);
        self.data[i] = v;
    }

    #[inline]
    pub fn get2(&self, i: usize, j: usize) -> f64 {
        debug_assert_eq!(self.layout.rank(), 2);
        debug_assert!(j < self.layout.inner_dim());
        self.data[i * self.inner_alloc + j]
    }

    #[inline]
    pub fn set2(&mut self, i: usize, j: usize, v: f64) {
        debug_assert_eq!(self.layout.rank(), 2);
        debug_assert!(j < self.layout.inner_dim());
        self.data[i * self.inner_alloc + j] = v;
    }

    #[inline]
    pub fn get3(&self, i: usize, j: usize, k: usize) -> f64 {
        debug_assert_eq!(self.layout.rank(), 3);
        debug_assert!(k < self.layout.inner_dim());
        self.data[(i * self.alloc_col_size()) + j * self.inner_alloc + k]
    }

    #[inline]
    pub fn set3(&mut self, i: usize, j: usize, k: usize, v: f64) {
        debug_assert_eq!(self.layout.rank(), 3);
        debug_assert!(k < self.layout.inner_dim());
        let w = self.alloc_col_size();
        self.data[i * w + j * self.inner_alloc + k] = v;
    }

    /// Largest pack width whose lanes tile the padded innermost dimension of
    /// both fields. Drives kernel dispatch.
    pub fn compatible_pack(&self, other: &Field) -> PackWidth {
        for p in PackWidth::DESCENDING {
            if p.divides(self.inner_alloc) && p.divides(other.inner_alloc) {
                return p;
            }
        }
        PackWidth::One
    }
}
