//! # coarse-remap
//!
//! coarse-remap is a distributed coarsening remapper for point-grid fields:
//! it applies a precomputed sparse linear map `y = A x` (read from a map
//! file of `(row, col, S)` triplets) to collections of spatially-decomposed
//! fields, moving partial row contributions between ranks and reducing them
//! at the row owner.
//!
//! ## Features
//! - Map-file ingestion with per-rank chunked and gather reads, plus
//!   redistribution so triplets land with their column owners
//! - Overlapped target grid and a local CRS matrix, turning the global
//!   sparse mat-vec into a strictly local one plus an all-to-some reduction
//! - Row-parallel kernels for 2-d/3-d scalar and vector fields with SIMD
//!   pack widths 1/4/8/16
//! - Pluggable communication backends (serial, mailbox threads, MPI) with
//!   persistent per-peer channels amortized across remap calls
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! coarse-remap = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! Construction reads the map once; fields are registered, bound, and the
//! exchange plan is finalized when registration closes. After that,
//! `remap(true)` is a single synchronous operation per call. The reverse
//! direction does not exist for a coarsening map.

pub mod comm;
pub mod error;
pub mod field;
pub mod grid;
pub mod io;
pub mod remap;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::comm::{
        CommTag, Communicator, NoComm, RayonComm, RecvChannel, RemapCommTags, SendChannel,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::error::RemapError;
    pub use crate::field::{Field, FieldLayout, PackWidth};
    pub use crate::grid::PointGrid;
    pub use crate::io::{MapFileReader, MapFileWriter};
    pub use crate::remap::CoarseningRemapper;
}

pub use error::RemapError;
pub use remap::CoarseningRemapper;
