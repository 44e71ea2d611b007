//! # boundary
//!
//! Material dependent overrides of density and velocity.
//!
//! Every rule is lowered into one conditional block of `collide_and_stream` that runs after the
//! moments are computed and before the collision. Rules are applied in order, so a later rule
//! wins for a tag that appears in several rules.

use std::collections::BTreeSet;

use crate::lbm::expr::{Assignment, Expr, Symbol};
use crate::lbm::types::material;
use crate::lbm::{LbmError, Result};

/// Overrides applied to every cell whose material is one of `materials`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundaryRule {
    pub materials: Vec<i32>,
    pub overrides: Vec<Assignment>,
}

impl BoundaryRule {
    pub fn new(materials: Vec<i32>, overrides: Vec<Assignment>) -> BoundaryRule {
        BoundaryRule {
            materials,
            overrides,
        }
    }

    /// Forces `u = 0`.
    pub fn no_slip(materials: &[i32], dimensions: usize) -> BoundaryRule {
        BoundaryRule::new(
            materials.to_vec(),
            (0..dimensions)
                .map(|k| Assignment::new(Symbol::U(k), Expr::Const(0.0)))
                .collect(),
        )
    }

    /// Prescribed velocity that ramps up linearly over `ramp_steps` steps, then holds.
    ///
    /// Component `k` becomes `min(time / ramp_steps * v_k, v_k)` (`max` for negative `v_k`).
    pub fn velocity_inlet(tag: i32, velocity: &[f64], ramp_steps: u32) -> BoundaryRule {
        let overrides = velocity
            .iter()
            .enumerate()
            .map(|(k, &v)| {
                let value = if v == 0.0 {
                    Expr::Const(0.0)
                } else if ramp_steps == 0 {
                    Expr::Const(v)
                } else {
                    let ramp = Expr::product([
                        Expr::Sym(Symbol::Time),
                        Expr::Const(v / ramp_steps as f64),
                    ]);
                    if v > 0.0 {
                        Expr::min(ramp, Expr::Const(v))
                    } else {
                        Expr::max(ramp, Expr::Const(v))
                    }
                };
                Assignment::new(Symbol::U(k), value)
            })
            .collect();
        BoundaryRule::new(vec![tag], overrides)
    }

    /// Fixes the density, e.g. at an outflow.
    pub fn fixed_density(tag: i32, rho: f64) -> BoundaryRule {
        BoundaryRule::new(vec![tag], vec![Assignment::new(Symbol::Rho, Expr::Const(rho))])
    }

    /// Checks that the rule only rewrites moments the kernel has and only reads moments and time.
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        if self.materials.is_empty() {
            return Err(LbmError::MalformedBoundary(
                "rule does not name any material".to_owned(),
            ));
        }
        if self.materials.contains(&material::GHOST) {
            return Err(LbmError::MalformedBoundary(
                "ghost cells (0) are never collided and cannot carry overrides".to_owned(),
            ));
        }
        for a in &self.overrides {
            match a.target {
                Symbol::Rho => {}
                Symbol::U(k) if k < dimensions => {}
                other => {
                    return Err(LbmError::MalformedBoundary(format!(
                        "cannot assign {} in a {}D kernel",
                        other, dimensions
                    )))
                }
            }
            let mut bad: Option<Symbol> = None;
            a.value.visit_symbols(&mut |s| match s {
                Symbol::Rho | Symbol::Time => {}
                Symbol::U(k) if k < dimensions => {}
                other => bad = bad.or(Some(other)),
            });
            if let Some(s) = bad {
                return Err(LbmError::MalformedBoundary(format!(
                    "override of {} reads {}",
                    a.target, s
                )));
            }
        }
        Ok(())
    }
}

/// Ordered list of boundary rules.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundaryConditions {
    rules: Vec<BoundaryRule>,
}

impl BoundaryConditions {
    pub fn new(rules: Vec<BoundaryRule>) -> BoundaryConditions {
        BoundaryConditions { rules }
    }

    pub fn push(&mut self, rule: BoundaryRule) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: BoundaryRule) -> BoundaryConditions {
        self.push(rule);
        self
    }

    pub fn rules(&self) -> &[BoundaryRule] {
        &self.rules
    }

    pub fn validate(&self, dimensions: usize) -> Result<()> {
        self.rules.iter().try_for_each(|r| r.validate(dimensions))
    }

    /// Rules restricted to the materials in `present`. Rules left without materials are dropped.
    pub fn restricted_to(&self, present: &BTreeSet<i32>) -> Vec<BoundaryRule> {
        self.rules
            .iter()
            .filter_map(|r| {
                let materials: Vec<i32> = r
                    .materials
                    .iter()
                    .copied()
                    .filter(|m| present.contains(m))
                    .collect();
                if materials.is_empty() {
                    None
                } else {
                    Some(BoundaryRule::new(materials, r.overrides.clone()))
                }
            })
            .collect()
    }

    /// No-slip walls and obstacles, a ramped inlet and a fixed-density outlet.
    pub fn channel(dimensions: usize, inflow: &[f64], ramp_steps: u32) -> BoundaryConditions {
        BoundaryConditions::default()
            .with(BoundaryRule::no_slip(&[material::WALL, material::OBSTACLE], dimensions))
            .with(BoundaryRule::velocity_inlet(material::INFLOW, inflow, ramp_steps))
            .with(BoundaryRule::fixed_density(material::OUTFLOW, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inlet_ramps_then_holds() {
        let rule = BoundaryRule::velocity_inlet(3, &[0.0, 0.05], 100);
        rule.validate(2).unwrap();
        let u1 = &rule.overrides[1].value;
        let at = |t: f64| u1.eval(&|s| if s == Symbol::Time { t } else { 0.0 });
        assert!((at(0.0) - 0.0).abs() < 1e-15);
        assert!((at(50.0) - 0.025).abs() < 1e-12);
        assert!((at(100.0) - 0.05).abs() < 1e-12);
        assert!((at(1000.0) - 0.05).abs() < 1e-12);
        assert_eq!(rule.overrides[0].value, Expr::Const(0.0));

        let reverse = BoundaryRule::velocity_inlet(3, &[-0.02], 10);
        let u0 = &reverse.overrides[0].value;
        assert!((u0.eval(&|_| 20.0) + 0.02).abs() < 1e-12);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        assert!(BoundaryRule::no_slip(&[2], 3).validate(2).is_err());
        assert!(BoundaryRule::no_slip(&[0], 2).validate(2).is_err());
        assert!(BoundaryRule::new(vec![], vec![]).validate(2).is_err());
        let reads_population = BoundaryRule::new(
            vec![2],
            vec![Assignment::new(Symbol::Rho, Expr::Sym(Symbol::F(0)))],
        );
        assert!(matches!(
            reads_population.validate(2),
            Err(LbmError::MalformedBoundary(_))
        ));
        assert!(BoundaryConditions::channel(3, &[0.01, 0.0, 0.0], 10)
            .validate(3)
            .is_ok());
    }

    #[test]
    fn restriction_drops_absent_tags() {
        let bc = BoundaryConditions::channel(2, &[0.0, 0.01], 10);
        let present: BTreeSet<i32> = [0, 1, 2].into_iter().collect();
        let rules = bc.restricted_to(&present);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].materials, vec![2]);
    }

    #[test]
    fn rules_round_trip_through_json() {
        let bc = BoundaryConditions::channel(2, &[0.0, 0.01], 10);
        let text = serde_json::to_string(&bc).unwrap();
        let back: BoundaryConditions = serde_json::from_str(&text).unwrap();
        assert_eq!(bc, back);
    }
}
