//! # descriptor
//!
//! Discrete velocity tables for the supported lattice stencils.
//!
//! Directions are ordered the same way for every stencil: the x component runs fastest from -1 to 1,
//! y and z run from 1 to -1. In 2D this gives
//! ```text
//!   0   1   2
//!   3   4   5
//!   6   7   8
//! ```
//! with the rest direction in the middle, so the opposite of direction `i` is always `q - 1 - i`.

use crate::lbm::{LbmError, Result, VelocitySet};

/// Velocity vectors and weights of one stencil. Constructed once, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    set: VelocitySet,
    dimensions: usize,
    c: Vec<[i32; 3]>,
    w: Vec<f64>,
}

impl Descriptor {
    /// Returns the descriptor of `set`. Only D2Q9 and D3Q27 have tables.
    pub fn new(set: VelocitySet) -> Result<Descriptor> {
        let (dimensions, weights): (usize, &[f64]) = match set {
            VelocitySet::D2Q9 => (2, &[4.0 / 9.0, 1.0 / 9.0, 1.0 / 36.0]),
            VelocitySet::D3Q27 => (3, &[8.0 / 27.0, 2.0 / 27.0, 1.0 / 54.0, 1.0 / 216.0]),
            other => {
                return Err(LbmError::UnsupportedDescriptor(format!(
                    "{:?} has no descriptor table (supported: D2Q9, D3Q27)",
                    other
                )))
            }
        };

        let z_range: &[i32] = if dimensions == 3 { &[1, 0, -1] } else { &[0] };
        let mut c = Vec::new();
        let mut w = Vec::new();
        for &z in z_range {
            for y in [1, 0, -1] {
                for x in [-1, 0, 1] {
                    let non_zero = (x != 0) as usize + (y != 0) as usize + (z != 0) as usize;
                    c.push([x, y, z]);
                    w.push(weights[non_zero]);
                }
            }
        }

        Ok(Descriptor {
            set,
            dimensions,
            c,
            w,
        })
    }

    pub fn velocity_set(&self) -> VelocitySet {
        self.set
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of discrete velocities.
    pub fn q(&self) -> usize {
        self.c.len()
    }

    pub fn velocities(&self) -> &[[i32; 3]] {
        &self.c
    }

    pub fn velocity(&self, i: usize) -> [i32; 3] {
        self.c[i]
    }

    pub fn weights(&self) -> &[f64] {
        &self.w
    }

    pub fn weight(&self, i: usize) -> f64 {
        self.w[i]
    }

    /// Position of velocity `c` in this descriptor, `None` if it is not part of the stencil.
    pub fn direction_index(&self, c: [i32; 3]) -> Option<usize> {
        if c.iter().any(|v| v.abs() > 1) || (self.dimensions == 2 && c[2] != 0) {
            return None;
        }
        let mut i = (c[0] + 1) + 3 * (1 - c[1]);
        if self.dimensions == 3 {
            i += 9 * (1 - c[2]);
        }
        Some(i as usize)
    }

    /// Index of the direction `-c_i`.
    pub fn opposite(&self, i: usize) -> usize {
        self.q() - 1 - i
    }
}
