//! Pipeline orchestration for the `silt` driver binary.

pub mod compiler;
