//! # lbm
//!
//! Contains methods for generating and running lattice Boltzmann simulations
//!
//! Structured into:
//! - `descriptor`: velocity sets and weights
//! - `expr`, `formulas`: symbolic moments, equilibrium and BGK collision
//! - `boundary`: material dependent density/velocity overrides
//! - `codegen`: lowering into a kernel program and OpenCL C emission
//! - `device`, `host`: the compute device seam and the CPU executor
//! - `domain`: OpenCL device (feature `opencl`)
//! - `geometry`: region based material maps
//!
//! The [`Lattice`] struct ties these together.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use rayon::prelude::*;

pub mod boundary;
pub mod codegen;
pub mod descriptor;
pub mod device;
#[cfg(feature = "opencl")]
pub mod domain;
mod error;
pub mod expr;
pub mod formulas;
pub mod geometry;
pub mod host;
mod types;

use boundary::BoundaryConditions;
use codegen::KernelProgram;
use descriptor::Descriptor;
use device::ComputeDevice;
use formulas::FormulaSet;
use host::HostDevice;
use geometry::MaterialMap;

pub use error::*;
pub use types::*;

/// Struct used to bundle arguments for lattice setup.
///
/// Use this struct to configure a simulation and then instantiate it with `Lattice::new(LatticeConfig)`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LatticeConfig {
    /// Velocity discretization
    pub velocity_set: VelocitySet,
    /// Size of the grid on each axis. `n_z` is 1 for 2D sets.
    pub n_x: u32,
    pub n_y: u32,
    pub n_z: u32,
    /// BGK relaxation time, must be greater than 0.5
    pub tau: f32,
    /// Hoist common subexpressions out of the generated kernels
    pub optimize: bool,
    /// Boundary overrides, applied in order
    #[serde(default)]
    pub boundary: BoundaryConditions,
}

impl Default for LatticeConfig {
    fn default() -> LatticeConfig {
        LatticeConfig {
            velocity_set: VelocitySet::D2Q9,
            n_x: 32,
            n_y: 32,
            n_z: 1,
            tau: 0.6,
            optimize: true,
            boundary: BoundaryConditions::default(),
        }
    }
}

impl LatticeConfig {
    /// Returns `LatticeConfig` with default values
    pub fn new() -> LatticeConfig {
        LatticeConfig::default()
    }

    /// Sets `tau` from the kinematic viscosity in lattice units, `tau = 3 nu + 1/2`.
    pub fn with_viscosity(mut self, nu: f32) -> LatticeConfig {
        self.tau = 3.0 * nu + 0.5;
        self
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.n_x, self.n_y, self.n_z)
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<LatticeConfig> {
        log::info!("Reading lattice configuration from \"{}\"", path.as_ref().display());
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        log::info!("Writing lattice configuration to \"{}\"", path.as_ref().display());
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Throughput in million lattice updates per second.
pub fn mlups(cells: usize, steps: u64, elapsed: Duration) -> f64 {
    cells as f64 * steps as f64 / elapsed.as_secs_f64() * 1e-6
}

/// To start a simulation, initialise a Lattice struct:
/// ```ignore
/// let mut lattice = Lattice::new(LatticeConfig::new())?;
/// lattice.apply_material_map(&map)?;
/// lattice.equilibrate(1.0, [0.0; 3])?;
/// lattice.evolve()?;
/// lattice.collect_moments()?;
/// lattice.sync()?;
/// let moments = lattice.moments()?;
/// ```
/// The lattice owns a [`ComputeDevice`] holding both population buffers, the material buffer, the
/// moments buffer and the compiled [`KernelProgram`]. Dispatches are queued on the device; host
/// reads are only allowed after [`Lattice::sync`].
pub struct Lattice {
    config: LatticeConfig,
    descriptor: Descriptor,
    formulas: FormulaSet,
    grid: Grid,
    device: Box<dyn ComputeDevice>,
    program: KernelProgram,
    program_loaded: bool,
    materials: Option<Vec<i32>>,
    current: Buffer,
    time: u32,
    unsynced: bool,
    statistics: Vec<Moments>,
}

impl Lattice {
    /// Returns a new `Lattice` executing on the host.
    pub fn new(config: LatticeConfig) -> Result<Lattice> {
        Lattice::with_device(config, HostDevice::new())
    }

    /// Returns a new `Lattice` executing on the fastest available OpenCL device.
    #[cfg(feature = "opencl")]
    pub fn new_opencl(config: LatticeConfig) -> Result<Lattice> {
        let (platform, device) = crate::opencl::device_selection()?;
        Lattice::with_device(config, domain::OpenClDevice::new(platform, device)?)
    }

    pub fn with_device<D: ComputeDevice + 'static>(config: LatticeConfig, device: D) -> Result<Lattice> {
        let descriptor = Descriptor::new(config.velocity_set)?;
        let formulas = FormulaSet::new(&descriptor, config.tau, config.optimize)?;
        let grid = config.grid();
        let program = KernelProgram::generate(
            &formulas,
            grid,
            &config.boundary,
            [material::GHOST].into_iter().collect(),
        )?;

        let mut device: Box<dyn ComputeDevice> = Box::new(device);
        device.allocate(descriptor.q(), descriptor.dimensions(), grid.volume())?;
        log::info!(
            "Allocated {:?} lattice {}x{}x{} ({} cells) on {}",
            config.velocity_set,
            grid.n_x,
            grid.n_y,
            grid.n_z,
            grid.volume(),
            device.name()
        );

        Ok(Lattice {
            config,
            descriptor,
            formulas,
            grid,
            device,
            program,
            program_loaded: false,
            materials: None,
            current: Buffer::A,
            time: 0,
            unsynced: false,
            statistics: Vec::new(),
        })
    }

    /// Resolves `map` and writes it to the material buffer.
    pub fn apply_material_map(&mut self, map: &MaterialMap) -> Result<()> {
        if map.grid() != self.grid {
            return Err(LbmError::InvalidGrid(format!(
                "material map is {}x{}x{} but the lattice is {}x{}x{}",
                map.grid().n_x,
                map.grid().n_y,
                map.grid().n_z,
                self.grid.n_x,
                self.grid.n_y,
                self.grid.n_z
            )));
        }
        self.apply_materials(&map.resolve())
    }

    /// Writes raw material tags in grid-index order. Recompiles the kernel program if the set of
    /// material codes differs from the one the current program was built for.
    pub fn apply_materials(&mut self, tags: &[i32]) -> Result<()> {
        if tags.len() != self.grid.volume() {
            return Err(LbmError::BufferSizeMismatch {
                buffer: "material",
                expected: self.grid.volume(),
                found: tags.len(),
            });
        }
        let grid = self.grid;
        let dimensions = self.descriptor.dimensions();
        let exposed = tags.par_iter().enumerate().find_first(|&(n, &tag)| {
            let (x, y, z) = grid.coordinates(n);
            tag != material::GHOST && grid.is_edge(x, y, z, dimensions)
        });
        if let Some((n, &tag)) = exposed {
            let (x, y, z) = grid.coordinates(n);
            return Err(LbmError::ExposedCell { x, y, z, tag });
        }

        let codes: BTreeSet<i32> = tags.iter().copied().collect();
        if !self.program_loaded || &codes != self.program.material_codes() {
            self.program = KernelProgram::generate(&self.formulas, grid, &self.config.boundary, codes)?;
            self.load_program()?;
        }
        self.device.write_material(tags)?;
        self.materials = Some(tags.to_vec());
        self.unsynced = true;
        Ok(())
    }

    /// Replaces the boundary rules and recompiles.
    pub fn set_boundary(&mut self, boundary: BoundaryConditions) -> Result<()> {
        boundary.validate(self.descriptor.dimensions())?;
        let codes = self.program.material_codes().clone();
        self.program = KernelProgram::generate(&self.formulas, self.grid, &boundary, codes)?;
        self.config.boundary = boundary;
        if self.program_loaded {
            self.load_program()?;
        }
        Ok(())
    }

    fn load_program(&mut self) -> Result<()> {
        self.device.load_program(&self.program)?;
        self.program_loaded = true;
        log::info!(
            "Compiled kernels for materials {:?} on {}",
            self.program.material_codes(),
            self.device.name()
        );
        Ok(())
    }

    /// Fills both buffers with the equilibrium distribution of `rho` and `u`.
    pub fn equilibrate(&mut self, rho: f64, u: [f64; 3]) -> Result<()> {
        let q = self.descriptor.q();
        let n = self.grid.volume();
        let feq = self.formulas.equilibrium_populations(rho, u);
        let mut populations = Populations::new(q, n);
        populations
            .as_mut_slice()
            .par_chunks_mut(n)
            .zip(feq.par_iter())
            .for_each(|(block, &value)| block.fill(value as f32));
        self.write_populations(&populations)
    }

    /// Uploads arbitrary initial populations to both buffers.
    pub fn write_populations(&mut self, populations: &Populations) -> Result<()> {
        let expected = self.descriptor.q() * self.grid.volume();
        if populations.q() != self.descriptor.q() || populations.cells() != self.grid.volume() {
            return Err(LbmError::BufferSizeMismatch {
                buffer: "populations",
                expected,
                found: populations.as_slice().len(),
            });
        }
        self.device.write_populations(Buffer::A, populations.as_slice())?;
        self.device.write_populations(Buffer::B, populations.as_slice())?;
        self.unsynced = true;
        Ok(())
    }

    /// Enqueues one collide and stream step and flips the current buffer.
    pub fn evolve(&mut self) -> Result<()> {
        if self.materials.is_none() {
            return Err(LbmError::MaterialNotAssigned);
        }
        self.device.enqueue_collide_and_stream(self.current, self.time)?;
        self.current = self.current.other();
        self.time += 1;
        self.unsynced = true;
        Ok(())
    }

    /// Enqueues `steps` evolve calls.
    pub fn run(&mut self, steps: u32) -> Result<()> {
        for _ in 0..steps {
            self.evolve()?;
        }
        Ok(())
    }

    /// Enqueues moment extraction from the current buffer.
    pub fn collect_moments(&mut self) -> Result<()> {
        if !self.program_loaded {
            return Err(LbmError::MaterialNotAssigned);
        }
        self.device.enqueue_collect_moments(self.current)?;
        self.unsynced = true;
        Ok(())
    }

    /// Blocks until every enqueued write and dispatch has completed.
    pub fn sync(&mut self) -> Result<()> {
        self.device.finish()?;
        self.unsynced = false;
        Ok(())
    }

    /// Moments from the last `collect_moments`.
    pub fn moments(&mut self) -> Result<Moments> {
        if self.unsynced {
            return Err(LbmError::Unsynchronized);
        }
        let d = self.descriptor.dimensions();
        let n = self.grid.volume();
        let mut data = vec![0.0; (d + 1) * n];
        self.device.read_moments(&mut data)?;
        Moments::from_vec(d, n, data)
    }

    /// Populations of the current buffer.
    pub fn populations(&mut self) -> Result<Populations> {
        if self.unsynced {
            return Err(LbmError::Unsynchronized);
        }
        let q = self.descriptor.q();
        let n = self.grid.volume();
        let mut data = vec![0.0; q * n];
        self.device.read_populations(self.current, &mut data)?;
        Populations::from_vec(q, n, data)
    }

    /// Collects, synchronizes and stores a snapshot of the moments.
    pub fn record_statistics(&mut self) -> Result<&Moments> {
        self.collect_moments()?;
        self.sync()?;
        let moments = self.moments()?;
        self.statistics.push(moments);
        Ok(&self.statistics[self.statistics.len() - 1])
    }

    pub fn statistics(&self) -> &[Moments] {
        &self.statistics
    }

    pub fn take_statistics(&mut self) -> Vec<Moments> {
        std::mem::take(&mut self.statistics)
    }

    /// Number of completed `evolve` calls.
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn current_buffer(&self) -> Buffer {
        self.current
    }

    pub fn program(&self) -> &KernelProgram {
        &self.program
    }

    pub fn materials(&self) -> Option<&[i32]> {
        self.materials.as_deref()
    }

    pub fn config(&self) -> &LatticeConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn device_name(&self) -> String {
        self.device.name()
    }
}
