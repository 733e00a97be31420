//! RemapError: unified error type for the coarse-remap public APIs.
//!
//! Every fallible operation in this crate reports through this enum; nothing
//! is recovered internally. I/O and MPI failures are environmental and fatal
//! to the remapper instance that hit them.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for coarsening-remap operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemapError {
    /// The source grid handed to the constructor is not globally unique.
    #[error("source grid `{0}` is not a unique point grid (some gid is owned by more than one rank)")]
    InvalidSourceGrid(String),

    /// Any failure reading or decoding the sparse-map file.
    #[error("map file error at {path:?}: {msg}")]
    MapFileIo { path: PathBuf, msg: String },

    /// Counts or prefix sums disagree after local construction.
    #[error("triplet bookkeeping mismatch in {context}: expected {expected}, got {got}")]
    TripletInconsistency {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    /// The source/target field pair does not form a supported layout pairing.
    #[error("unsupported field layout pairing for field `{field}`: src {src}, tgt {tgt}")]
    UnsupportedLayout {
        field: String,
        src: String,
        tgt: String,
    },

    /// 2-d scalar fields must be allocated without trailing padding.
    #[error("field `{0}` is a 2d scalar with nonzero trailing padding; pack width must be 1")]
    UnsupportedPadding(String),

    /// This remapper only goes source -> target.
    #[error("coarsening remap only supports the forward (source -> target) direction")]
    UnsupportedDirection,

    /// An MPI primitive returned non-success.
    #[error("MPI failure in {op} (error code {code})")]
    MpiFailure { op: &'static str, code: i32 },

    /// A point-to-point exchange with a peer failed or returned bad data.
    #[error("communication with rank {neighbor} failed: {msg}")]
    CommError { neighbor: usize, msg: String },

    /// A gid was looked up on a grid that does not hold it.
    #[error("gid {gid} not found on grid `{grid}`")]
    UnknownGid { gid: u64, grid: String },

    /// A grid was constructed with the same gid twice.
    #[error("duplicate gid {gid} while constructing grid `{grid}`")]
    DuplicateGid { gid: u64, grid: String },

    /// A registration-phase call arrived in the wrong state.
    #[error("cannot {op}: field registration is {state}")]
    InvalidRegistrationState {
        op: &'static str,
        state: &'static str,
    },

    /// `remap` was called before registration closed and all fields were bound.
    #[error("remap called before registration completed (all fields must be bound first)")]
    RegistrationIncomplete,

    /// A field index was out of bounds for the registered set.
    #[error("field index {index} out of bounds ({len} fields registered)")]
    FieldIndexOutOfBounds { index: usize, len: usize },

    /// Two buffers or extents that must agree do not.
    #[error("size mismatch in {context}: expected {expected}, got {got}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
}
