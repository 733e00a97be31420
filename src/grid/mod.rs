//! Point grids: distributed, unordered sets of globally-unique dof ids.

pub mod point_grid;

pub use point_grid::PointGrid;
