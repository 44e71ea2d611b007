//! # geometry
//!
//! Geometry to material tag resolution.
//!
//! A [`MaterialMap`] is an ordered list of regions paired with tags. Every cell receives the tag of
//! the last region that contains it, or ghost (0) if none does.

use std::fmt;

use rayon::prelude::*;

use crate::lbm::types::{material, Grid};

/// Coordinate axis of a cylinder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

/// Closed set of region shapes. Coordinates are cell coordinates.
pub enum Region {
    /// Arbitrary user test.
    Predicate(Box<dyn Fn(u32, u32, u32) -> bool + Send + Sync>),
    /// `|p - center|^2 < radius^2`
    Sphere { center: [f32; 3], radius: f32 },
    /// `min <= p < max` on every axis.
    Cuboid { min: [u32; 3], max: [u32; 3] },
    /// Strict radius test around `center` in the plane normal to `axis`,
    /// half-open extent `[start, end)` along `axis`.
    Cylinder {
        axis: Axis,
        center: [f32; 3],
        radius: f32,
        start: u32,
        end: u32,
    },
}

impl Region {
    pub fn predicate<F: Fn(u32, u32, u32) -> bool + Send + Sync + 'static>(f: F) -> Region {
        Region::Predicate(Box::new(f))
    }

    pub fn contains(&self, x: u32, y: u32, z: u32) -> bool {
        let p = [x, y, z];
        match self {
            Region::Predicate(f) => f(x, y, z),
            Region::Sphere { center, radius } => {
                let d2: f32 = (0..3).map(|k| (p[k] as f32 - center[k]).powi(2)).sum();
                d2 < radius * radius
            }
            Region::Cuboid { min, max } => (0..3).all(|k| min[k] <= p[k] && p[k] < max[k]),
            Region::Cylinder {
                axis,
                center,
                radius,
                start,
                end,
            } => {
                let a = *axis as usize;
                let along = p[a];
                let d2: f32 = (0..3)
                    .filter(|&k| k != a)
                    .map(|k| (p[k] as f32 - center[k]).powi(2))
                    .sum();
                *start <= along && along < *end && d2 < radius * radius
            }
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Predicate(_) => write!(f, "Predicate(..)"),
            Region::Sphere { center, radius } => f
                .debug_struct("Sphere")
                .field("center", center)
                .field("radius", radius)
                .finish(),
            Region::Cuboid { min, max } => f
                .debug_struct("Cuboid")
                .field("min", min)
                .field("max", max)
                .finish(),
            Region::Cylinder {
                axis,
                center,
                radius,
                start,
                end,
            } => f
                .debug_struct("Cylinder")
                .field("axis", axis)
                .field("center", center)
                .field("radius", radius)
                .field("start", start)
                .field("end", end)
                .finish(),
        }
    }
}

/// Ordered regions and their tags for one grid.
#[derive(Debug)]
pub struct MaterialMap {
    grid: Grid,
    regions: Vec<(Region, i32)>,
}

impl MaterialMap {
    pub fn new(grid: Grid) -> MaterialMap {
        MaterialMap {
            grid,
            regions: Vec::new(),
        }
    }

    /// Closed box: ghost outer layer, walls on the next layer, bulk inside.
    /// For a 2D grid (`dimensions == 2`) only x and y are layered.
    pub fn enclosure(grid: Grid, dimensions: usize) -> MaterialMap {
        let inset = |k: u32| {
            let layered = dimensions == 3;
            Region::Cuboid {
                min: [k, k, if layered { k } else { 0 }],
                max: [
                    grid.n_x.saturating_sub(k),
                    grid.n_y.saturating_sub(k),
                    if layered { grid.n_z.saturating_sub(k) } else { grid.n_z },
                ],
            }
        };
        MaterialMap::new(grid)
            .with(inset(1), material::WALL)
            .with(inset(2), material::BULK)
    }

    pub fn push(&mut self, region: Region, tag: i32) {
        self.regions.push((region, tag));
    }

    pub fn with(mut self, region: Region, tag: i32) -> MaterialMap {
        self.push(region, tag);
        self
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn regions(&self) -> &[(Region, i32)] {
        &self.regions
    }

    /// Tag of a single cell.
    pub fn tag(&self, x: u32, y: u32, z: u32) -> i32 {
        self.regions
            .iter()
            .rev()
            .find(|(region, _)| region.contains(x, y, z))
            .map_or(material::GHOST, |(_, tag)| *tag)
    }

    /// Tags of all cells in grid-index order.
    pub fn resolve(&self) -> Vec<i32> {
        let grid = self.grid;
        (0..grid.volume())
            .into_par_iter()
            .map(|n| {
                let (x, y, z) = grid.coordinates(n);
                self.tag(x, y, z)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_matching_region_wins() {
        let grid = Grid::new(8, 8, 1);
        let map = MaterialMap::new(grid)
            .with(Region::predicate(|_, _, _| true), 1)
            .with(Region::Cuboid { min: [2, 2, 0], max: [6, 6, 1] }, 2)
            .with(Region::Sphere { center: [4.0, 4.0, 0.0], radius: 1.5 }, 5);
        let tags = map.resolve();
        assert_eq!(tags[grid.index(0, 0, 0)], 1);
        assert_eq!(tags[grid.index(2, 2, 0)], 2);
        assert_eq!(tags[grid.index(5, 5, 0)], 5);
        assert_eq!(tags[grid.index(4, 4, 0)], 5);
        // half-open upper bound
        assert_eq!(tags[grid.index(6, 3, 0)], 1);

        let reversed = MaterialMap::new(grid)
            .with(Region::Cuboid { min: [2, 2, 0], max: [6, 6, 1] }, 2)
            .with(Region::predicate(|_, _, _| true), 1);
        assert!(reversed.resolve().iter().all(|&t| t == 1));
    }

    #[test]
    fn unmatched_cells_are_ghost() {
        let map = MaterialMap::new(Grid::new(4, 4, 1)).with(Region::Cuboid { min: [1, 1, 0], max: [3, 3, 1] }, 1);
        let tags = map.resolve();
        assert_eq!(tags.iter().filter(|&&t| t == material::GHOST).count(), 12);
    }

    #[test]
    fn sphere_is_strict() {
        let sphere = Region::Sphere { center: [0.0, 0.0, 0.0], radius: 2.0 };
        assert!(sphere.contains(1, 1, 0));
        assert!(!sphere.contains(2, 0, 0));
    }

    #[test]
    fn cylinder_is_bounded_along_its_axis() {
        let cylinder = Region::Cylinder {
            axis: Axis::Z,
            center: [5.0, 5.0, 0.0],
            radius: 2.0,
            start: 1,
            end: 4,
        };
        assert!(cylinder.contains(5, 6, 1));
        assert!(cylinder.contains(6, 6, 3));
        assert!(!cylinder.contains(5, 5, 0));
        assert!(!cylinder.contains(5, 5, 4));
        assert!(!cylinder.contains(7, 5, 2));
    }

    #[test]
    fn enclosure_layers() {
        let grid = Grid::new(6, 5, 1);
        let tags = MaterialMap::enclosure(grid, 2).resolve();
        assert_eq!(tags[grid.index(0, 2, 0)], material::GHOST);
        assert_eq!(tags[grid.index(1, 2, 0)], material::WALL);
        assert_eq!(tags[grid.index(2, 2, 0)], material::BULK);
        assert_eq!(tags[grid.index(3, 3, 0)], material::WALL);
        assert_eq!(tags[grid.index(5, 2, 0)], material::GHOST);

        let grid = Grid::new(5, 5, 5);
        let tags = MaterialMap::enclosure(grid, 3).resolve();
        assert_eq!(tags[grid.index(2, 2, 0)], material::GHOST);
        assert_eq!(tags[grid.index(2, 2, 1)], material::WALL);
        assert_eq!(tags[grid.index(2, 2, 2)], material::BULK);
    }
}
