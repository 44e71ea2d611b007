//! # device
//!
//! The `ComputeDevice` trait is the seam between the lattice engine and an execution backend.
//!
//! A device owns the two population buffers, the material buffer, the moments buffer and the
//! compiled program. Writes and dispatches are enqueued in order on a single queue; nothing
//! enqueued is guaranteed to have happened before `finish()` returns.

use crate::lbm::codegen::KernelProgram;
use crate::lbm::{Buffer, Result};

pub trait ComputeDevice {
    /// Human readable device name, used for logging.
    fn name(&self) -> String;

    /// Allocates `q * cells` populations per buffer, `cells` material tags and
    /// `(dimensions + 1) * cells` moments. Called once before anything else.
    fn allocate(&mut self, q: usize, dimensions: usize, cells: usize) -> Result<()>;

    /// Compiles `program`, replacing any previously loaded one.
    fn load_program(&mut self, program: &KernelProgram) -> Result<()>;

    fn write_material(&mut self, tags: &[i32]) -> Result<()>;

    fn write_populations(&mut self, target: Buffer, data: &[f32]) -> Result<()>;

    /// Enqueues `collide_and_stream` reading `current` and writing `current.other()`.
    fn enqueue_collide_and_stream(&mut self, current: Buffer, time: u32) -> Result<()>;

    /// Enqueues `collect_moments` reading `current`.
    fn enqueue_collect_moments(&mut self, current: Buffer) -> Result<()>;

    /// Blocks until every enqueued command has completed.
    fn finish(&mut self) -> Result<()>;

    fn read_populations(&mut self, source: Buffer, out: &mut [f32]) -> Result<()>;

    fn read_moments(&mut self, out: &mut [f32]) -> Result<()>;
}
