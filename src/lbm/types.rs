//! # types
//!
//! Contains and organizes types used in the lbm module.
//! These types are re-exported through the lbm module.

use crate::lbm::{LbmError, Result};

/// Velocity discretizations in 2D and 3D.
///
/// - `D2Q9`:  2D
/// - `D3Q15`: 3D low precision (no descriptor table)
/// - `D3Q19`: 3D recommended elsewhere (no descriptor table)
/// - `D3Q27`: 3D highest precision
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VelocitySet {
    #[default]
    /// 2D
    D2Q9 = 0,
    /// 3D low precision
    D3Q15 = 1,
    /// 3D
    D3Q19 = 2,
    /// 3D highest precision
    D3Q27 = 3,
}

impl VelocitySet {
    /// Returns `(dimensions, velocities)` of the set.
    pub fn get_set_values(&self) -> (u8, u8) {
        match self {
            VelocitySet::D2Q9 => (2, 9),
            VelocitySet::D3Q15 => (3, 15),
            VelocitySet::D3Q19 => (3, 19),
            VelocitySet::D3Q27 => (3, 27),
        }
    }
}

/// Material tags understood by the built-in boundary rules.
///
/// Tags are plain `i32` values in the material buffer, any other value is allowed
/// and behaves like bulk fluid unless a boundary rule mentions it.
pub mod material {
    /// Skipped by `collide_and_stream`, holds stale values.
    pub const GHOST: i32 = 0;
    pub const BULK: i32 = 1;
    pub const WALL: i32 = 2;
    pub const INFLOW: i32 = 3;
    pub const OUTFLOW: i32 = 4;
    pub const OBSTACLE: i32 = 5;
}

/// Identifies one of the two population buffers.
///
/// The lattice marks exactly one of them as current. `collide_and_stream` reads the current
/// buffer and writes the other one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Buffer {
    A = 0,
    B = 1,
}

impl Buffer {
    pub fn other(self) -> Buffer {
        match self {
            Buffer::A => Buffer::B,
            Buffer::B => Buffer::A,
        }
    }
}

/// Regular grid with linear index `x + (y + z * n_y) * n_x`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grid {
    pub n_x: u32,
    pub n_y: u32,
    pub n_z: u32,
}

impl Grid {
    pub fn new(n_x: u32, n_y: u32, n_z: u32) -> Grid {
        Grid { n_x, n_y, n_z }
    }

    /// Number of cells.
    pub fn volume(&self) -> usize {
        self.n_x as usize * self.n_y as usize * self.n_z as usize
    }

    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (z as usize * self.n_y as usize + y as usize) * self.n_x as usize + x as usize
    }

    /// Get `x, y, z` coordinates from 1D index `n`.
    pub fn coordinates(&self, n: usize) -> (u32, u32, u32) {
        let a = self.n_x as usize * self.n_y as usize;
        let t = n % a;
        (
            (t % self.n_x as usize) as u32,
            (t / self.n_x as usize) as u32,
            (n / a) as u32,
        )
    }

    /// Linear index stride of each axis.
    pub fn strides(&self) -> [isize; 3] {
        [1, self.n_x as isize, self.n_x as isize * self.n_y as isize]
    }

    /// True for cells on the outermost layer of a used axis.
    pub fn is_edge(&self, x: u32, y: u32, z: u32, dimensions: usize) -> bool {
        x == 0
            || x == self.n_x - 1
            || y == 0
            || y == self.n_y - 1
            || (dimensions == 3 && (z == 0 || z == self.n_z - 1))
    }
}

/// Host copy of one population buffer, direction-major: value `i` of cell `n` is at `i * N + n`.
#[derive(Clone, Debug, PartialEq)]
pub struct Populations {
    q: usize,
    n: usize,
    data: Vec<f32>,
}

impl Populations {
    pub fn new(q: usize, n: usize) -> Populations {
        Populations {
            q,
            n,
            data: vec![0.0; q * n],
        }
    }

    pub fn from_vec(q: usize, n: usize, data: Vec<f32>) -> Result<Populations> {
        if data.len() != q * n {
            return Err(LbmError::BufferSizeMismatch {
                buffer: "populations",
                expected: q * n,
                found: data.len(),
            });
        }
        Ok(Populations { q, n, data })
    }

    pub fn q(&self) -> usize {
        self.q
    }

    pub fn cells(&self) -> usize {
        self.n
    }

    pub fn get(&self, n: usize, i: usize) -> f32 {
        self.data[i * self.n + n]
    }

    pub fn set(&mut self, n: usize, i: usize, value: f32) {
        self.data[i * self.n + n] = value;
    }

    /// All `q` values of cell `n`.
    pub fn cell(&self, n: usize) -> Vec<f32> {
        (0..self.q).map(|i| self.get(n, i)).collect()
    }

    pub fn set_cell(&mut self, n: usize, values: &[f32]) {
        for (i, &v) in values.iter().enumerate().take(self.q) {
            self.set(n, i, v);
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Host copy of the moments buffer: density block followed by one block per velocity component.
///
/// Each block holds `N` values in grid index order. `as_slice()` is the flat array handed to renderers.
#[derive(Clone, Debug, PartialEq)]
pub struct Moments {
    dimensions: usize,
    n: usize,
    data: Vec<f32>,
}

impl Moments {
    pub fn from_vec(dimensions: usize, n: usize, data: Vec<f32>) -> Result<Moments> {
        if data.len() != (dimensions + 1) * n {
            return Err(LbmError::BufferSizeMismatch {
                buffer: "moments",
                expected: (dimensions + 1) * n,
                found: data.len(),
            });
        }
        Ok(Moments { dimensions, n, data })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn cells(&self) -> usize {
        self.n
    }

    pub fn density(&self, n: usize) -> f32 {
        self.data[n]
    }

    /// Velocity of cell `n`, unused components are 0.
    pub fn velocity(&self, n: usize) -> [f32; 3] {
        let mut u = [0.0f32; 3];
        for (k, u_k) in u.iter_mut().enumerate().take(self.dimensions) {
            *u_k = self.data[(k + 1) * self.n + n];
        }
        u
    }

    /// Sum of densities over the cells selected by `mask`.
    pub fn total_density<F: Fn(usize) -> bool>(&self, mask: F) -> f64 {
        (0..self.n).filter(|&n| mask(n)).map(|n| self.density(n) as f64).sum()
    }

    /// Largest velocity magnitude over the cells selected by `mask`.
    pub fn max_speed<F: Fn(usize) -> bool>(&self, mask: F) -> f32 {
        (0..self.n)
            .filter(|&n| mask(n))
            .map(|n| {
                let u = self.velocity(n);
                (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt()
            })
            .fold(0.0f32, f32::max)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
