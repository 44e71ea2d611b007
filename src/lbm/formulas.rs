//! # formulas
//!
//! Symbolic moments, equilibrium and BGK collision for a [`Descriptor`].
//!
//! The formulas only know about populations, density and velocity. Boundary overrides are
//! applied by the kernel generator between the moments and the collision block.

use crate::lbm::descriptor::Descriptor;
use crate::lbm::expr::{Assignment, Block, Expr, Stage, Symbol};
use crate::lbm::{LbmError, Result};

/// Moments, equilibrium and collision expressions for one descriptor and relaxation time.
#[derive(Clone, Debug)]
pub struct FormulaSet {
    descriptor: Descriptor,
    tau: f32,
    optimize: bool,
}

impl FormulaSet {
    /// `tau` must be greater than 1/2. With `optimize` set, the moment and collision blocks
    /// are returned with common subexpressions hoisted into helpers.
    pub fn new(descriptor: &Descriptor, tau: f32, optimize: bool) -> Result<FormulaSet> {
        if !(tau > 0.5) || !tau.is_finite() {
            return Err(LbmError::InvalidRelaxationTime(tau));
        }
        Ok(FormulaSet {
            descriptor: descriptor.clone(),
            tau,
            optimize,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn tau(&self) -> f32 {
        self.tau
    }

    /// `rho = sum f_i`, `u_k = sum f_i c_ik / rho`.
    pub fn moments(&self) -> Block {
        let d = &self.descriptor;
        let mut statements = vec![Assignment::new(
            Symbol::Rho,
            Expr::sum((0..d.q()).map(|i| Expr::Sym(Symbol::F(i)))),
        )];
        for k in 0..d.dimensions() {
            let momentum = Expr::sum(d.velocities().iter().enumerate().filter_map(|(i, c)| {
                match c[k] {
                    0 => None,
                    1 => Some(Expr::Sym(Symbol::F(i))),
                    v => Some(Expr::product([Expr::Const(v as f64), Expr::Sym(Symbol::F(i))])),
                }
            }));
            statements.push(Assignment::new(Symbol::U(k), momentum / Expr::Sym(Symbol::Rho)));
        }
        self.finish(Block::new(statements), Stage::Moments)
    }

    /// Second order equilibrium of direction `i` in terms of `rho` and `u`.
    pub fn equilibrium(&self, i: usize) -> Expr {
        let d = &self.descriptor;
        let c = d.velocity(i);
        let cu = Expr::sum((0..d.dimensions()).filter(|&k| c[k] != 0).map(|k| {
            Expr::product([Expr::Const(c[k] as f64), Expr::Sym(Symbol::U(k))])
        }));
        let uu = Expr::sum(
            (0..d.dimensions()).map(|k| Expr::Sym(Symbol::U(k)) * Expr::Sym(Symbol::U(k))),
        );
        Expr::product([
            Expr::Const(d.weight(i)),
            Expr::Sym(Symbol::Rho),
            Expr::sum([
                Expr::Const(1.0),
                Expr::Const(3.0) * cu.clone(),
                Expr::Const(4.5) * cu.clone() * cu,
                Expr::Const(-1.5) * uu,
            ]),
        ])
        .simplify()
    }

    /// BGK relaxation `f_next_i = f_i - (f_i - f_eq_i) / tau`.
    pub fn collide(&self) -> Block {
        let omega = 1.0 / self.tau as f64;
        let statements = (0..self.descriptor.q())
            .map(|i| {
                let f = Expr::Sym(Symbol::F(i));
                let relaxed = f.clone() - Expr::Const(omega) * (f - self.equilibrium(i));
                Assignment::new(Symbol::FNext(i), relaxed)
            })
            .collect();
        self.finish(Block::new(statements), Stage::Collide)
    }

    /// Numeric equilibrium populations for a given density and velocity.
    pub fn equilibrium_populations(&self, rho: f64, u: [f64; 3]) -> Vec<f64> {
        let env = |s: Symbol| match s {
            Symbol::Rho => rho,
            Symbol::U(k) => u[k],
            _ => 0.0,
        };
        (0..self.descriptor.q())
            .map(|i| self.equilibrium(i).eval(&env))
            .collect()
    }

    fn finish(&self, block: Block, stage: Stage) -> Block {
        let block = block.simplify();
        if self.optimize {
            block.cse(stage)
        } else {
            block
        }
    }
}
