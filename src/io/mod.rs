//! On-disk formats read and written by the remapper.

pub mod map_file;

pub use map_file::{MapFileReader, MapFileWriter};
