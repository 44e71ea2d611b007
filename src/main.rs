//! Headless runner. Loads `lattice.json` from the working directory if present, otherwise runs a
//! built-in channel flow past a cylinder, and logs throughput and moment statistics.

use std::path::Path;
use std::time::Instant;

use lbm_codegen::lbm::boundary::BoundaryConditions;
use lbm_codegen::lbm::geometry::{Axis, MaterialMap, Region};
use lbm_codegen::lbm::{self, material, Grid, Lattice, LatticeConfig, VelocitySet};

const CONFIG_PATH: &str = "lattice.json";
const STEPS: u32 = 10_000;
const REPORT_EVERY: u32 = 1_000;
const INFLOW: f64 = 0.05;
const RAMP_STEPS: u32 = 1_000;

fn main() -> lbm::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = if Path::new(CONFIG_PATH).exists() {
        LatticeConfig::read(CONFIG_PATH)?
    } else {
        log::info!("No {} found, using the built-in channel", CONFIG_PATH);
        channel_config()
    };
    let dimensions = config.velocity_set.get_set_values().0 as usize;
    let grid = config.grid();

    let mut lattice = new_lattice(config)?;
    lattice.apply_material_map(&channel_map(grid, dimensions))?;
    lattice.equilibrate(1.0, [0.0; 3])?;
    lattice.sync()?;

    let fluid: Vec<bool> = lattice
        .materials()
        .unwrap_or_default()
        .iter()
        .map(|&m| m == material::BULK)
        .collect();

    let mut done = 0;
    while done < STEPS {
        let steps = REPORT_EVERY.min(STEPS - done);
        let now = Instant::now();
        lattice.run(steps)?;
        lattice.sync()?;
        let elapsed = now.elapsed();
        done += steps;

        let moments = lattice.record_statistics()?;
        log::info!(
            "step {:>6}: {:8.2} MLUPS, mass {:.4}, max |u| {:.4}",
            done,
            lbm::mlups(grid.volume(), steps as u64, elapsed),
            moments.total_density(|n| fluid[n]),
            moments.max_speed(|n| fluid[n])
        );
    }
    log::info!("Finished {} steps", lattice.time());
    Ok(())
}

#[cfg(feature = "opencl")]
fn new_lattice(config: LatticeConfig) -> lbm::Result<Lattice> {
    match Lattice::new_opencl(config.clone()) {
        Ok(lattice) => Ok(lattice),
        Err(e) => {
            log::warn!("OpenCL unavailable ({}), running on the host", e);
            Lattice::new(config)
        }
    }
}

#[cfg(not(feature = "opencl"))]
fn new_lattice(config: LatticeConfig) -> lbm::Result<Lattice> {
    Lattice::new(config)
}

fn channel_config() -> LatticeConfig {
    LatticeConfig {
        velocity_set: VelocitySet::D2Q9,
        n_x: 256,
        n_y: 64,
        n_z: 1,
        boundary: BoundaryConditions::channel(2, &[INFLOW, 0.0], RAMP_STEPS),
        ..LatticeConfig::new()
    }
    .with_viscosity(0.02)
}

/// Enclosed channel with an inflow column on the left, an outflow column on the right and a
/// cylinder a quarter of the way downstream.
fn channel_map(grid: Grid, dimensions: usize) -> MaterialMap {
    let (z_min, z_max) = if dimensions == 3 { (2, grid.n_z - 2) } else { (0, grid.n_z) };
    let radius = grid.n_y as f32 / 8.0;
    let center = [grid.n_x as f32 / 4.0, grid.n_y as f32 / 2.0, grid.n_z as f32 / 2.0];
    let obstacle = if dimensions == 3 {
        Region::Sphere { center, radius }
    } else {
        Region::Cylinder {
            axis: Axis::Z,
            center,
            radius,
            start: 0,
            end: grid.n_z,
        }
    };
    MaterialMap::enclosure(grid, dimensions)
        .with(
            Region::Cuboid {
                min: [1, 2, z_min],
                max: [2, grid.n_y - 2, z_max],
            },
            material::INFLOW,
        )
        .with(
            Region::Cuboid {
                min: [grid.n_x - 2, 2, z_min],
                max: [grid.n_x - 1, grid.n_y - 2, z_max],
            },
            material::OUTFLOW,
        )
        .with(obstacle, material::OBSTACLE)
}
