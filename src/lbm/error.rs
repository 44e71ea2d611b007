//! # error
//!
//! Error type shared by every part of the lbm module.

use thiserror::Error;

/// Errors raised while configuring, compiling or running a lattice.
///
/// Configuration and device errors are fatal for the run they occur in.
/// `Unsynchronized` and `MaterialNotAssigned` flag sequencing mistakes by the caller.
#[derive(Debug, Error)]
pub enum LbmError {
    /// The lattice family has no descriptor table.
    #[error("Unsupported descriptor: {0}")]
    UnsupportedDescriptor(String),

    /// Grid dimensions do not fit the descriptor.
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// BGK needs tau > 1/2 for a positive viscosity.
    #[error("Invalid relaxation time {0}: tau must be greater than 0.5")]
    InvalidRelaxationTime(f32),

    /// A boundary rule cannot be lowered.
    #[error("Malformed boundary rule: {0}")]
    MalformedBoundary(String),

    /// A host array does not match the buffer it is written to.
    #[error("Buffer size mismatch for {buffer}: expected {expected} values, got {found}")]
    BufferSizeMismatch {
        buffer: &'static str,
        expected: usize,
        found: usize,
    },

    /// A non-ghost cell on the outermost layer would stream from outside the grid.
    #[error("Cell ({x}, {y}, {z}) on the grid edge has material {tag}; edge cells must be ghost (0)")]
    ExposedCell { x: u32, y: u32, z: u32, tag: i32 },

    #[error("evolve() called before a material map was applied")]
    MaterialNotAssigned,

    #[error("Host read of device buffers without a preceding sync()")]
    Unsynchronized,

    /// Compiler output, passed through verbatim.
    #[error("Kernel compilation failed:\n{0}")]
    KernelCompilation(String),

    /// Writing generated source text failed.
    #[error("Formatting error: {0}")]
    Format(#[from] std::fmt::Error),

    #[error("Device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

#[cfg(feature = "opencl")]
impl From<ocl::Error> for LbmError {
    fn from(e: ocl::Error) -> Self {
        LbmError::Device(e.to_string())
    }
}

/// Convenience alias for `Result<T, LbmError>`.
pub type Result<T> = std::result::Result<T, LbmError>;
