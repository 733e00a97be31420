//! Field layouts and SIMD pack widths.
//!
//! The layout set is closed: a coarsening remap moves 2-d scalars, 2-d
//! vectors, 3-d scalars and 3-d vectors, nothing else. Midpoint vs interface
//! 3-d fields differ only in their level count, so both are `Scalar3D` /
//! `Vector3D` here. Dimension 0 (the grid column) is never part of the
//! layout; it comes from the grid a field is allocated on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of a field, excluding the column dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldLayout {
    /// One scalar per column.
    Scalar2D,
    /// `ncomp` components per column.
    Vector2D { ncomp: usize },
    /// `nlevs` vertical levels per column.
    Scalar3D { nlevs: usize },
    /// `ncomp` components of `nlevs` levels per column.
    Vector3D { ncomp: usize, nlevs: usize },
}

impl FieldLayout {
    /// Tensor rank including the column dimension.
    #[inline]
    pub fn rank(&self) -> usize {
        match self {
            FieldLayout::Scalar2D => 1,
            FieldLayout::Vector2D { .. } | FieldLayout::Scalar3D { .. } => 2,
            FieldLayout::Vector3D { .. } => 3,
        }
    }

    /// Number of scalars per column (product of non-column dims, unpadded).
    #[inline]
    pub fn col_size(&self) -> usize {
        match *self {
            FieldLayout::Scalar2D => 1,
            FieldLayout::Vector2D { ncomp } => ncomp,
            FieldLayout::Scalar3D { nlevs } => nlevs,
            FieldLayout::Vector3D { ncomp, nlevs } => ncomp * nlevs,
        }
    }

    /// Extent of the innermost dimension, the one padding applies to.
    #[inline]
    pub fn inner_dim(&self) -> usize {
        match *self {
            FieldLayout::Scalar2D => 1,
            FieldLayout::Vector2D { ncomp } => ncomp,
            FieldLayout::Scalar3D { nlevs } => nlevs,
            FieldLayout::Vector3D { nlevs, .. } => nlevs,
        }
    }
}

impl fmt::Display for FieldLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FieldLayout::Scalar2D => write!(f, "Scalar2D"),
            FieldLayout::Vector2D { ncomp } => write!(f, "Vector2D[{ncomp}]"),
            FieldLayout::Scalar3D { nlevs } => write!(f, "Scalar3D[{nlevs}]"),
            FieldLayout::Vector3D { ncomp, nlevs } => write!(f, "Vector3D[{ncomp}x{nlevs}]"),
        }
    }
}

/// Number of scalar lanes grouped along the innermost dimension.
///
/// Allocation pads the innermost dimension up to a multiple of the pack
/// width; kernels pick the largest width both operands tolerate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PackWidth {
    One,
    Four,
    Eight,
    Sixteen,
}

impl PackWidth {
    /// Dispatch order: try the widest first.
    pub const DESCENDING: [PackWidth; 4] = [
        PackWidth::Sixteen,
        PackWidth::Eight,
        PackWidth::Four,
        PackWidth::One,
    ];

    #[inline]
    pub const fn get(self) -> usize {
        match self {
            PackWidth::One => 1,
            PackWidth::Four => 4,
            PackWidth::Eight => 8,
            PackWidth::Sixteen => 16,
        }
    }

    /// Round `n` up to a multiple of this width.
    #[inline]
    pub const fn round_up(self, n: usize) -> usize {
        let p = self.get();
        (n + p - 1) / p * p
    }

    #[inline]
    pub const fn divides(self, n: usize) -> bool {
        n % self.get() == 0
    }
}

impl fmt::Display for PackWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}
