//! Fields: flat `f64` tensors whose dimension 0 is the grid (column)
//! dimension, with SIMD-friendly padded allocation.

pub mod field;
pub mod layout;

pub use field::Field;
pub use layout::{FieldLayout, PackWidth};
