//! Lattice Boltzmann solver that generates its compute kernels from symbolic formulas.
//!
//! See [`lbm::Lattice`] for the entry point.

pub mod lbm;
#[cfg(feature = "opencl")]
pub mod opencl;
