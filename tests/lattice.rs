use approx::assert_abs_diff_eq;

use lbm_codegen::lbm::boundary::{BoundaryConditions, BoundaryRule};
use lbm_codegen::lbm::descriptor::Descriptor;
use lbm_codegen::lbm::geometry::{MaterialMap, Region};
use lbm_codegen::lbm::{material, Grid, Lattice, LatticeConfig, LbmError, Populations, VelocitySet};

fn config(set: VelocitySet, n: u32) -> LatticeConfig {
    let n_z = if set == VelocitySet::D2Q9 { 1 } else { n };
    LatticeConfig {
        velocity_set: set,
        n_x: n,
        n_y: n,
        n_z,
        tau: 0.8,
        ..LatticeConfig::new()
    }
}

fn dims(set: VelocitySet) -> usize {
    set.get_set_values().0 as usize
}

/// Closed box at rest: equilibrium populations with density 1.
fn resting_box(config: LatticeConfig) -> Lattice {
    let grid = config.grid();
    let d = dims(config.velocity_set);
    let mut lattice = Lattice::new(config).unwrap();
    lattice.apply_material_map(&MaterialMap::enclosure(grid, d)).unwrap();
    lattice.equilibrate(1.0, [0.0; 3]).unwrap();
    lattice.sync().unwrap();
    lattice
}

fn center(grid: Grid) -> usize {
    grid.index(grid.n_x / 2, grid.n_y / 2, grid.n_z / 2)
}

#[test]
fn mass_is_conserved_away_from_walls() {
    let mut lattice = resting_box(config(VelocitySet::D2Q9, 32));
    let grid = lattice.grid();
    let mut populations = lattice.populations().unwrap();
    let c = center(grid);
    for i in 0..populations.q() {
        let v = populations.get(c, i);
        populations.set(c, i, v * 1.5);
    }
    lattice.write_populations(&populations).unwrap();
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();

    let tags = lattice.materials().unwrap().to_vec();
    let fluid = |n: usize| tags[n] != material::GHOST;
    let before = lattice.moments().unwrap().total_density(fluid);

    // the disturbance travels one cell per step and stays clear of the walls
    lattice.run(8).unwrap();
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();
    let after = lattice.moments().unwrap().total_density(fluid);

    assert!(before > grid.volume() as f64 * 0.5);
    assert_abs_diff_eq!(before, after, epsilon = 1e-3);
}

#[test]
fn ghost_cells_are_never_written() {
    let mut lattice = resting_box(config(VelocitySet::D2Q9, 16));
    let grid = lattice.grid();
    let mut populations = lattice.populations().unwrap();
    let c = center(grid);
    populations.set(c, 5, populations.get(c, 5) + 0.05);
    lattice.write_populations(&populations).unwrap();
    lattice.sync().unwrap();
    let initial = lattice.populations().unwrap();

    lattice.run(11).unwrap();
    lattice.sync().unwrap();
    let evolved = lattice.populations().unwrap();

    let tags = lattice.materials().unwrap();
    let mut ghosts = 0;
    for n in (0..grid.volume()).filter(|&n| tags[n] == material::GHOST) {
        assert_eq!(initial.cell(n), evolved.cell(n));
        ghosts += 1;
    }
    assert_eq!(ghosts, 4 * 15);
    assert_ne!(initial, evolved);
}

#[test]
fn moment_extraction_is_idempotent() {
    let mut lattice = resting_box(config(VelocitySet::D2Q9, 16));
    let mut populations = lattice.populations().unwrap();
    let c = center(lattice.grid());
    populations.set(c, 2, populations.get(c, 2) + 0.02);
    lattice.write_populations(&populations).unwrap();
    lattice.run(3).unwrap();

    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();
    let first = lattice.moments().unwrap();
    lattice.collect_moments().unwrap();
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();
    let second = lattice.moments().unwrap();

    assert_eq!(first, second);
    assert_eq!(lattice.time(), 3);
}

#[test]
fn later_regions_take_precedence() {
    let config = config(VelocitySet::D2Q9, 16);
    let grid = config.grid();
    let mut lattice = Lattice::new(config).unwrap();
    let map = MaterialMap::enclosure(grid, 2)
        .with(Region::Cuboid { min: [4, 4, 0], max: [12, 12, 1] }, material::OBSTACLE)
        .with(Region::Sphere { center: [8.0, 8.0, 0.0], radius: 2.5 }, material::BULK);
    lattice.apply_material_map(&map).unwrap();

    let tags = lattice.materials().unwrap();
    assert_eq!(tags[grid.index(8, 8, 0)], material::BULK);
    assert_eq!(tags[grid.index(4, 4, 0)], material::OBSTACLE);
    assert_eq!(tags[grid.index(1, 8, 0)], material::WALL);
    assert_eq!(tags[grid.index(0, 8, 0)], material::GHOST);
    assert_eq!(tags[grid.index(2, 8, 0)], material::BULK);
}

/// Perturbs population `i` of the center cell and returns the cells that differ from an
/// unperturbed run after one step.
fn impulse_response(set: VelocitySet, n: u32, i: usize) -> Vec<usize> {
    let mut reference = resting_box(config(set, n));
    let mut perturbed = resting_box(config(set, n));
    let grid = reference.grid();
    let c = center(grid);

    let mut populations: Populations = perturbed.populations().unwrap();
    populations.set(c, i, populations.get(c, i) + 0.01);
    perturbed.write_populations(&populations).unwrap();

    for lattice in [&mut reference, &mut perturbed] {
        lattice.evolve().unwrap();
        lattice.sync().unwrap();
    }
    let (a, b) = (reference.populations().unwrap(), perturbed.populations().unwrap());
    (0..grid.volume()).filter(|&n| a.cell(n) != b.cell(n)).collect()
}

#[test]
fn single_step_impulse_reaches_exactly_one_neighbor() {
    let cases: [(VelocitySet, Vec<usize>); 2] = [
        (VelocitySet::D2Q9, (0..9).collect()),
        (VelocitySet::D3Q27, vec![0, 4, 10, 13, 16, 22, 26]),
    ];
    for (set, directions) in cases {
        let n = 8;
        let grid = config(set, n).grid();
        let descriptor = Descriptor::new(set).unwrap();
        let (x, y, z) = grid.coordinates(center(grid));

        for i in directions {
            let c = descriptor.velocity(i);
            let target = grid.index(
                (x as i32 + c[0]) as u32,
                (y as i32 + c[1]) as u32,
                (z as i32 + c[2]) as u32,
            );
            assert_eq!(impulse_response(set, n, i), vec![target], "{set:?} direction {i}");
        }
    }
}

#[test]
fn closed_box_stays_at_rest() {
    let cfg = LatticeConfig {
        boundary: BoundaryConditions::default().with(BoundaryRule::no_slip(&[material::WALL], 2)),
        ..config(VelocitySet::D2Q9, 32)
    };
    let mut lattice = resting_box(cfg);
    lattice.run(1000).unwrap();
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();

    let moments = lattice.moments().unwrap();
    let tags = lattice.materials().unwrap();
    for n in (0..moments.cells()).filter(|&n| tags[n] == material::BULK) {
        assert_abs_diff_eq!(moments.density(n), 1.0, epsilon = 1e-3);
        let u = moments.velocity(n);
        assert_abs_diff_eq!(u[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(u[1], 0.0, epsilon = 1e-4);
    }
    assert_eq!(lattice.time(), 1000);
}

#[test]
fn closed_cube_stays_at_rest() {
    let cfg = LatticeConfig {
        boundary: BoundaryConditions::default().with(BoundaryRule::no_slip(&[material::WALL], 3)),
        ..config(VelocitySet::D3Q27, 10)
    };
    let mut lattice = resting_box(cfg);
    lattice.run(50).unwrap();
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();

    let moments = lattice.moments().unwrap();
    let tags = lattice.materials().unwrap();
    for n in (0..moments.cells()).filter(|&n| tags[n] == material::BULK) {
        assert_abs_diff_eq!(moments.density(n), 1.0, epsilon = 1e-3);
        assert!(moments.velocity(n).iter().all(|u| u.abs() < 1e-4));
    }
}

#[test]
fn inlet_drives_flow_downstream() {
    let cfg = LatticeConfig {
        n_x: 48,
        n_y: 24,
        boundary: BoundaryConditions::channel(2, &[0.02, 0.0], 100),
        ..config(VelocitySet::D2Q9, 24)
    };
    let grid = cfg.grid();
    let map = MaterialMap::enclosure(grid, 2)
        .with(Region::Cuboid { min: [1, 2, 0], max: [2, 22, 1] }, material::INFLOW)
        .with(Region::Cuboid { min: [46, 2, 0], max: [47, 22, 1] }, material::OUTFLOW);
    let mut lattice = Lattice::new(cfg).unwrap();
    lattice.apply_material_map(&map).unwrap();
    lattice.equilibrate(1.0, [0.0; 3]).unwrap();
    assert_eq!(lattice.program().boundary().len(), 3);

    lattice.run(300).unwrap();
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();
    let moments = lattice.moments().unwrap();

    let near_inlet: Vec<f32> = (4..20).map(|y| moments.velocity(grid.index(4, y, 0))[0]).collect();
    let mean = near_inlet.iter().sum::<f32>() / near_inlet.len() as f32;
    assert!(mean > 1e-3, "mean u_x near the inlet is {mean}");
    assert!(moments.as_slice().iter().all(|v| v.is_finite()));
}

#[test]
fn moments_are_density_then_velocity_blocks() {
    let mut lattice = resting_box(config(VelocitySet::D2Q9, 8));
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();
    let moments = lattice.moments().unwrap();
    let flat = moments.as_slice();
    assert_eq!(flat.len(), 3 * 64);
    assert!(flat[..64].iter().all(|&rho| (rho - 1.0).abs() < 1e-6));
    assert!(flat[64..].iter().all(|&u| u.abs() < 1e-6));
}

#[test]
fn ordering_mistakes_fail_fast() {
    let mut lattice = Lattice::new(config(VelocitySet::D2Q9, 8)).unwrap();
    assert!(matches!(lattice.evolve(), Err(LbmError::MaterialNotAssigned)));
    assert!(matches!(lattice.collect_moments(), Err(LbmError::MaterialNotAssigned)));

    let mut lattice = resting_box(config(VelocitySet::D2Q9, 8));
    lattice.evolve().unwrap();
    assert!(matches!(lattice.populations(), Err(LbmError::Unsynchronized)));
    lattice.sync().unwrap();
    assert!(lattice.populations().is_ok());
}

#[test]
fn statistics_accumulate_snapshots() {
    let mut lattice = resting_box(config(VelocitySet::D2Q9, 8));
    for _ in 0..3 {
        lattice.run(2).unwrap();
        lattice.record_statistics().unwrap();
    }
    assert_eq!(lattice.statistics().len(), 3);
    let taken = lattice.take_statistics();
    assert_eq!(taken.len(), 3);
    assert!(lattice.statistics().is_empty());
}

/// Five steps with an inflow column, then the inflow is replaced by plain bulk.
fn reassigned_after_steps(sync_first: bool) -> Vec<f32> {
    let cfg = LatticeConfig {
        n_x: 24,
        n_y: 12,
        boundary: BoundaryConditions::channel(2, &[0.05, 0.0], 1),
        ..config(VelocitySet::D2Q9, 12)
    };
    let grid = cfg.grid();
    let plain = MaterialMap::enclosure(grid, 2);
    let inflow = MaterialMap::enclosure(grid, 2)
        .with(Region::Cuboid { min: [1, 2, 0], max: [2, 10, 1] }, material::INFLOW);

    let mut lattice = Lattice::new(cfg).unwrap();
    lattice.apply_material_map(&inflow).unwrap();
    lattice.equilibrate(1.0, [0.0; 3]).unwrap();
    lattice.run(5).unwrap();
    if sync_first {
        lattice.sync().unwrap();
    }
    lattice.apply_material_map(&plain).unwrap();
    assert!(!lattice.program().material_codes().contains(&material::INFLOW));
    assert_eq!(lattice.program().boundary().len(), 1);
    lattice.collect_moments().unwrap();
    lattice.sync().unwrap();
    lattice.moments().unwrap().as_slice().to_vec()
}

#[test]
fn recompilation_waits_for_queued_steps() {
    let synced = reassigned_after_steps(true);
    let queued = reassigned_after_steps(false);
    assert!(synced.iter().skip(synced.len() / 3).any(|u| u.abs() > 1e-4));
    for (a, b) in synced.iter().zip(&queued) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
}
