//! # host
//!
//! `HostDevice` executes a [`KernelProgram`] on the CPU.
//!
//! The program is compiled into small stack-machine tapes, one per assignment. Dispatches are
//! data parallel over cells with rayon: every cell computes its outputs into a cell-major scratch
//! buffer, which is then scattered into the direction-major target buffer. Commands wait in an
//! in-order queue until `finish()`.

use std::collections::{HashMap, VecDeque};

use rayon::prelude::*;

use crate::lbm::codegen::KernelProgram;
use crate::lbm::device::ComputeDevice;
use crate::lbm::expr::{Block, Expr, Symbol};
use crate::lbm::types::material;
use crate::lbm::{Buffer, LbmError, Result};

#[derive(Clone, Copy, Debug)]
enum Op {
    Const(f32),
    Load(usize),
    Sum(usize),
    Product(usize),
    Div,
    Min,
    Max,
}

/// Postfix evaluation of one expression.
#[derive(Clone, Debug)]
struct Tape {
    ops: Vec<Op>,
}

impl Tape {
    fn compile(expr: &Expr, slots: &HashMap<Symbol, usize>) -> Result<Tape> {
        fn walk(e: &Expr, slots: &HashMap<Symbol, usize>, ops: &mut Vec<Op>) -> Result<()> {
            match e {
                Expr::Const(v) => ops.push(Op::Const(*v as f32)),
                Expr::Sym(s) => {
                    let slot = slots.get(s).ok_or_else(|| {
                        LbmError::KernelCompilation(format!("{s} is used before it is assigned"))
                    })?;
                    ops.push(Op::Load(*slot));
                }
                Expr::Sum(v) | Expr::Product(v) => {
                    for c in v {
                        walk(c, slots, ops)?;
                    }
                    ops.push(match e {
                        Expr::Sum(_) => Op::Sum(v.len()),
                        _ => Op::Product(v.len()),
                    });
                }
                Expr::Div(a, b) | Expr::Min(a, b) | Expr::Max(a, b) => {
                    walk(a, slots, ops)?;
                    walk(b, slots, ops)?;
                    ops.push(match e {
                        Expr::Div(..) => Op::Div,
                        Expr::Min(..) => Op::Min,
                        _ => Op::Max,
                    });
                }
            }
            Ok(())
        }
        let mut ops = Vec::new();
        walk(expr, slots, &mut ops)?;
        Ok(Tape { ops })
    }

    fn eval(&self, regs: &[f32], stack: &mut Vec<f32>) -> f32 {
        stack.clear();
        for op in &self.ops {
            match *op {
                Op::Const(v) => stack.push(v),
                Op::Load(slot) => stack.push(regs[slot]),
                Op::Sum(n) => {
                    let start = stack.len() - n;
                    let s = stack[start..].iter().sum();
                    stack.truncate(start);
                    stack.push(s);
                }
                Op::Product(n) => {
                    let start = stack.len() - n;
                    let p = stack[start..].iter().product();
                    stack.truncate(start);
                    stack.push(p);
                }
                Op::Div | Op::Min | Op::Max => {
                    let b = stack.pop().unwrap_or(f32::NAN);
                    let a = stack.pop().unwrap_or(f32::NAN);
                    stack.push(match *op {
                        Op::Div => a / b,
                        Op::Min => a.min(b),
                        _ => a.max(b),
                    });
                }
            }
        }
        stack.pop().unwrap_or(f32::NAN)
    }
}

#[derive(Clone, Debug)]
struct Statement {
    slot: usize,
    tape: Tape,
}

#[derive(Clone, Debug)]
struct Branch {
    materials: Vec<i32>,
    statements: Vec<Statement>,
}

/// Register layout: `F(0..q)`, `rho`, `u_0..u_2`, `time`, then outputs and helpers in order of assignment.
#[derive(Clone, Debug)]
struct HostProgram {
    q: usize,
    dimensions: usize,
    stream_offsets: Vec<isize>,
    registers: usize,
    moments: Vec<Statement>,
    boundary: Vec<Branch>,
    collide: Vec<Statement>,
    f_next: Vec<usize>,
    moment_slots: Vec<usize>,
    time_slot: usize,
}

impl HostProgram {
    fn compile(program: &KernelProgram) -> Result<HostProgram> {
        let q = program.descriptor().q();
        let dimensions = program.descriptor().dimensions();
        let mut slots: HashMap<Symbol, usize> = HashMap::new();
        for i in 0..q {
            slots.insert(Symbol::F(i), i);
        }
        slots.insert(Symbol::Rho, q);
        for k in 0..dimensions {
            slots.insert(Symbol::U(k), q + 1 + k);
        }
        slots.insert(Symbol::Time, q + 4);

        fn block(b: &Block, slots: &mut HashMap<Symbol, usize>, next: &mut usize) -> Result<Vec<Statement>> {
            let mut statements = Vec::new();
            for a in b.statements() {
                let tape = Tape::compile(&a.value, slots)?;
                let slot = *slots.entry(a.target).or_insert_with(|| {
                    *next += 1;
                    *next - 1
                });
                statements.push(Statement { slot, tape });
            }
            Ok(statements)
        }

        let mut next = q + 5;
        let moments = block(program.moments(), &mut slots, &mut next)?;
        let mut boundary = Vec::new();
        for rule in program.boundary() {
            let mut statements = Vec::new();
            for a in &rule.overrides {
                let slot = *slots.get(&a.target).ok_or_else(|| {
                    LbmError::KernelCompilation(format!("boundary rule assigns unknown {}", a.target))
                })?;
                statements.push(Statement {
                    slot,
                    tape: Tape::compile(&a.value, &slots)?,
                });
            }
            boundary.push(Branch {
                materials: rule.materials.clone(),
                statements,
            });
        }
        let collide = block(program.collide(), &mut slots, &mut next)?;

        let lookup = |s: Symbol| {
            slots
                .get(&s)
                .copied()
                .ok_or_else(|| LbmError::KernelCompilation(format!("{s} is never assigned")))
        };
        let f_next = (0..q).map(|i| lookup(Symbol::FNext(i))).collect::<Result<Vec<_>>>()?;
        let moment_slots = program
            .moments()
            .outputs()
            .map(|a| lookup(a.target))
            .collect::<Result<Vec<_>>>()?;

        Ok(HostProgram {
            q,
            dimensions,
            stream_offsets: program.stream_offsets().to_vec(),
            registers: next,
            moments,
            boundary,
            collide,
            f_next,
            moment_slots,
            time_slot: q + 4,
        })
    }

    fn run(statements: &[Statement], regs: &mut [f32], stack: &mut Vec<f32>) {
        for s in statements {
            regs[s.slot] = s.tape.eval(regs, stack);
        }
    }

    /// One cell of `collide_and_stream`. `out` receives the `q` post-collision values.
    fn collide_cell(&self, gid: usize, m: i32, prev: &[f32], time: f32, regs: &mut [f32], stack: &mut Vec<f32>, out: &mut [f32]) {
        for (i, offset) in self.stream_offsets.iter().enumerate() {
            regs[i] = prev[(gid as isize + offset) as usize];
        }
        regs[self.time_slot] = time;
        HostProgram::run(&self.moments, regs, stack);
        for branch in &self.boundary {
            if branch.materials.contains(&m) {
                HostProgram::run(&branch.statements, regs, stack);
            }
        }
        HostProgram::run(&self.collide, regs, stack);
        for (o, &slot) in out.iter_mut().zip(&self.f_next) {
            *o = regs[slot];
        }
    }

    /// One cell of `collect_moments`. `out` receives density and velocity.
    fn moments_cell(&self, gid: usize, n: usize, f: &[f32], regs: &mut [f32], stack: &mut Vec<f32>, out: &mut [f32]) {
        for i in 0..self.q {
            regs[i] = f[i * n + gid];
        }
        HostProgram::run(&self.moments, regs, stack);
        for (o, &slot) in out.iter_mut().zip(&self.moment_slots) {
            *o = regs[slot];
        }
    }
}

enum Command {
    LoadProgram(Box<HostProgram>),
    WriteMaterial(Vec<i32>),
    WritePopulations(Buffer, Vec<f32>),
    CollideAndStream { current: Buffer, time: u32 },
    CollectMoments { current: Buffer },
}

/// CPU execution of the generated kernels.
#[derive(Default)]
pub struct HostDevice {
    queue: VecDeque<Command>,
    n: usize,
    q: usize,
    dimensions: usize,
    f: [Vec<f32>; 2],
    material: Vec<i32>,
    moments: Vec<f32>,
    scratch: Vec<f32>,
    program: Option<HostProgram>,
}

impl HostDevice {
    pub fn new() -> HostDevice {
        HostDevice::default()
    }

    /// Number of commands waiting for `finish()`.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn check_len(buffer: &'static str, expected: usize, found: usize) -> Result<()> {
        if expected != found {
            return Err(LbmError::BufferSizeMismatch {
                buffer,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::LoadProgram(program) => self.program = Some(*program),
            Command::WriteMaterial(tags) => self.material = tags,
            Command::WritePopulations(target, data) => self.f[target as usize] = data,
            Command::CollideAndStream { current, time } => self.collide_and_stream(current, time)?,
            Command::CollectMoments { current } => self.collect_moments(current)?,
        }
        Ok(())
    }

    fn collide_and_stream(&mut self, current: Buffer, time: u32) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| LbmError::Device("collide_and_stream dispatched without a program".to_owned()))?;
        let (n, q) = (self.n, self.q);
        let material = &self.material;
        let [f_a, f_b] = &mut self.f;
        let (prev, next) = match current {
            Buffer::A => (&*f_a, f_b),
            Buffer::B => (&*f_b, f_a),
        };
        let scratch = &mut self.scratch;
        scratch.resize(n * q, 0.0);

        scratch.par_chunks_mut(q).enumerate().for_each_init(
            || (vec![0.0f32; program.registers], Vec::with_capacity(64)),
            |(regs, stack), (gid, out)| {
                let m = material[gid];
                if m != material::GHOST {
                    program.collide_cell(gid, m, prev, time as f32, regs, stack, out);
                }
            },
        );

        let scratch = &*scratch;
        next.par_chunks_mut(n).enumerate().for_each(|(i, block)| {
            for (gid, value) in block.iter_mut().enumerate() {
                if material[gid] != material::GHOST {
                    *value = scratch[gid * q + i];
                }
            }
        });
        Ok(())
    }

    fn collect_moments(&mut self, current: Buffer) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| LbmError::Device("collect_moments dispatched without a program".to_owned()))?;
        let n = self.n;
        let width = program.dimensions + 1;
        let f = &self.f[current as usize];
        let scratch = &mut self.scratch;
        scratch.resize(n * width.max(self.q), 0.0);

        scratch[..n * width].par_chunks_mut(width).enumerate().for_each_init(
            || (vec![0.0f32; program.registers], Vec::with_capacity(64)),
            |(regs, stack), (gid, out)| program.moments_cell(gid, n, f, regs, stack, out),
        );

        let scratch = &*scratch;
        self.moments.par_chunks_mut(n).enumerate().for_each(|(k, block)| {
            for (gid, value) in block.iter_mut().enumerate() {
                *value = scratch[gid * width + k];
            }
        });
        Ok(())
    }
}

impl ComputeDevice for HostDevice {
    fn name(&self) -> String {
        format!("host ({} threads)", rayon::current_num_threads())
    }

    fn allocate(&mut self, q: usize, dimensions: usize, cells: usize) -> Result<()> {
        self.q = q;
        self.dimensions = dimensions;
        self.n = cells;
        self.f = [vec![0.0; q * cells], vec![0.0; q * cells]];
        self.material = vec![material::GHOST; cells];
        self.moments = vec![0.0; (dimensions + 1) * cells];
        self.scratch = Vec::with_capacity(q * cells);
        Ok(())
    }

    fn load_program(&mut self, program: &KernelProgram) -> Result<()> {
        let d = program.descriptor();
        if program.grid().volume() != self.n || d.q() != self.q || d.dimensions() != self.dimensions {
            return Err(LbmError::Device(format!(
                "program for {} cells x {} populations does not fit buffers of {} x {}",
                program.grid().volume(),
                d.q(),
                self.n,
                self.q
            )));
        }
        // compiled now so errors surface here, swapped in behind already queued dispatches
        let compiled = HostProgram::compile(program)?;
        self.queue.push_back(Command::LoadProgram(Box::new(compiled)));
        Ok(())
    }

    fn write_material(&mut self, tags: &[i32]) -> Result<()> {
        HostDevice::check_len("material", self.n, tags.len())?;
        self.queue.push_back(Command::WriteMaterial(tags.to_vec()));
        Ok(())
    }

    fn write_populations(&mut self, target: Buffer, data: &[f32]) -> Result<()> {
        HostDevice::check_len("populations", self.n * self.q, data.len())?;
        self.queue.push_back(Command::WritePopulations(target, data.to_vec()));
        Ok(())
    }

    fn enqueue_collide_and_stream(&mut self, current: Buffer, time: u32) -> Result<()> {
        self.queue.push_back(Command::CollideAndStream { current, time });
        Ok(())
    }

    fn enqueue_collect_moments(&mut self, current: Buffer) -> Result<()> {
        self.queue.push_back(Command::CollectMoments { current });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        while let Some(command) = self.queue.pop_front() {
            self.execute(command)?;
        }
        Ok(())
    }

    fn read_populations(&mut self, source: Buffer, out: &mut [f32]) -> Result<()> {
        if !self.queue.is_empty() {
            return Err(LbmError::Unsynchronized);
        }
        HostDevice::check_len("populations", self.n * self.q, out.len())?;
        out.copy_from_slice(&self.f[source as usize]);
        Ok(())
    }

    fn read_moments(&mut self, out: &mut [f32]) -> Result<()> {
        if !self.queue.is_empty() {
            return Err(LbmError::Unsynchronized);
        }
        HostDevice::check_len("moments", self.moments.len(), out.len())?;
        out.copy_from_slice(&self.moments);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbm::boundary::BoundaryConditions;
    use crate::lbm::descriptor::Descriptor;
    use crate::lbm::formulas::FormulaSet;
    use crate::lbm::{Grid, VelocitySet};

    #[test]
    fn tape_matches_tree_evaluation() {
        let e = Expr::min(
            Expr::sum([Expr::Sym(Symbol::Rho), Expr::Const(2.0)]) / Expr::Sym(Symbol::U(0)),
            Expr::product([Expr::Const(3.0), Expr::Sym(Symbol::Time)]),
        );
        let slots: HashMap<Symbol, usize> = [(Symbol::Rho, 0), (Symbol::U(0), 1), (Symbol::Time, 2)]
            .into_iter()
            .collect();
        let tape = Tape::compile(&e, &slots).unwrap();
        let regs = [1.0f32, 0.5, 4.0];
        let mut stack = Vec::new();
        assert_eq!(tape.eval(&regs, &mut stack), 6.0);
        assert!(Tape::compile(&Expr::Sym(Symbol::F(0)), &slots).is_err());
    }

    #[test]
    fn queue_runs_only_on_finish() {
        let grid = Grid::new(4, 4, 1);
        let d = Descriptor::new(VelocitySet::D2Q9).unwrap();
        let formulas = FormulaSet::new(&d, 1.0, true).unwrap();
        let program =
            KernelProgram::generate(&formulas, grid, &BoundaryConditions::default(), [0].into_iter().collect())
                .unwrap();

        let mut device = HostDevice::new();
        device.allocate(9, 2, 16).unwrap();
        device.load_program(&program).unwrap();
        device.write_populations(Buffer::A, &vec![1.0; 9 * 16]).unwrap();
        device.enqueue_collect_moments(Buffer::A).unwrap();
        assert_eq!(device.pending(), 3);

        let mut moments = vec![0.0; 3 * 16];
        assert!(matches!(device.read_moments(&mut moments), Err(LbmError::Unsynchronized)));
        device.finish().unwrap();
        device.read_moments(&mut moments).unwrap();
        assert!(moments[..16].iter().all(|&rho| rho == 9.0));
        assert!(moments[16..].iter().all(|&u| u == 0.0));
    }

    /// One step on a 4x4 box under `first`, optionally followed by loading `second`.
    fn step(first: f32, second: Option<f32>, finish_between: bool) -> Vec<f32> {
        let grid = Grid::new(4, 4, 1);
        let d = Descriptor::new(VelocitySet::D2Q9).unwrap();
        let codes: std::collections::BTreeSet<i32> = [material::GHOST, material::BULK].into_iter().collect();
        let generate = |tau| {
            let formulas = FormulaSet::new(&d, tau, false).unwrap();
            KernelProgram::generate(&formulas, grid, &BoundaryConditions::default(), codes.clone()).unwrap()
        };
        let tags: Vec<i32> = (0..16)
            .map(|n| {
                let (x, y, z) = grid.coordinates(n);
                if grid.is_edge(x, y, z, 2) {
                    material::GHOST
                } else {
                    material::BULK
                }
            })
            .collect();
        let f: Vec<f32> = (0..9 * 16).map(|k| 0.1 + 0.01 * (k / 16) as f32).collect();

        let mut device = HostDevice::new();
        device.allocate(9, 2, 16).unwrap();
        device.load_program(&generate(first)).unwrap();
        device.write_material(&tags).unwrap();
        device.write_populations(Buffer::A, &f).unwrap();
        device.write_populations(Buffer::B, &f).unwrap();
        device.enqueue_collide_and_stream(Buffer::A, 0).unwrap();
        if finish_between {
            device.finish().unwrap();
        }
        if let Some(tau) = second {
            device.load_program(&generate(tau)).unwrap();
        }
        device.finish().unwrap();

        let mut out = vec![0.0; 9 * 16];
        device.read_populations(Buffer::B, &mut out).unwrap();
        out
    }

    #[test]
    fn program_swap_waits_for_queued_dispatches() {
        let slow = step(1.0, None, false);
        assert_ne!(slow, step(0.6, None, false));
        assert_eq!(step(1.0, Some(0.6), true), slow);
        assert_eq!(step(1.0, Some(0.6), false), slow);
    }
}
