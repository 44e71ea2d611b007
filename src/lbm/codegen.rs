//! # codegen
//!
//! Lowers a [`FormulaSet`], the grid size and the boundary rules into a [`KernelProgram`] with two
//! entry points, `collide_and_stream` and `collect_moments`, and emits it as OpenCL C.
//!
//! Streaming is folded into the read side of `collide_and_stream`: population `i` of a cell is
//! gathered from the neighbour at `-c_i`, i.e. from `gid + i * N + delta_i` with
//! `delta_i = -c_i . (1, n_x, n_x * n_y)`. Post-collision values are written back unshifted to
//! `i * N + gid` of the other buffer.

use std::collections::BTreeSet;
use std::fmt::{self, Write};

use crate::lbm::boundary::{BoundaryConditions, BoundaryRule};
use crate::lbm::descriptor::Descriptor;
use crate::lbm::expr::{Block, Expr, Symbol};
use crate::lbm::formulas::FormulaSet;
use crate::lbm::types::{material, Grid};
use crate::lbm::{LbmError, Result};

/// Lowered kernel program for one lattice configuration. Immutable once generated.
#[derive(Clone, Debug)]
pub struct KernelProgram {
    descriptor: Descriptor,
    grid: Grid,
    tau: f32,
    stream_offsets: Vec<isize>,
    moments: Block,
    boundary: Vec<BoundaryRule>,
    collide: Block,
    material_codes: BTreeSet<i32>,
}

impl KernelProgram {
    /// Generates the program for the materials in `material_codes`.
    /// Boundary rules for tags that do not occur are left out.
    pub fn generate(
        formulas: &FormulaSet,
        grid: Grid,
        boundary: &BoundaryConditions,
        material_codes: BTreeSet<i32>,
    ) -> Result<KernelProgram> {
        let descriptor = formulas.descriptor().clone();
        check_grid(&descriptor, grid)?;
        boundary.validate(descriptor.dimensions())?;

        let n = grid.volume() as isize;
        let strides = grid.strides();
        let stream_offsets = descriptor
            .velocities()
            .iter()
            .enumerate()
            .map(|(i, c)| i as isize * n + neighbor_offset(c, strides))
            .collect();

        let program = KernelProgram {
            grid,
            tau: formulas.tau(),
            stream_offsets,
            moments: formulas.moments(),
            boundary: boundary.restricted_to(&material_codes),
            collide: formulas.collide(),
            material_codes,
            descriptor,
        };
        log::debug!(
            "Generated {:?} kernel program for {}x{}x{}: {} moment statements, {} collide statements, {} boundary rules, materials {:?}",
            program.descriptor.velocity_set(),
            grid.n_x,
            grid.n_y,
            grid.n_z,
            program.moments.statements().len(),
            program.collide.statements().len(),
            program.boundary.len(),
            program.material_codes
        );
        Ok(program)
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn tau(&self) -> f32 {
        self.tau
    }

    /// Read offset of direction `i` relative to `gid`, including the `i * N` block offset.
    pub fn stream_offsets(&self) -> &[isize] {
        &self.stream_offsets
    }

    pub fn moments(&self) -> &Block {
        &self.moments
    }

    pub fn boundary(&self) -> &[BoundaryRule] {
        &self.boundary
    }

    pub fn collide(&self) -> &Block {
        &self.collide
    }

    /// Material codes the boundary branches were specialised for.
    pub fn material_codes(&self) -> &BTreeSet<i32> {
        &self.material_codes
    }

    /// Emits OpenCL C source with the entry points `collide_and_stream` and `collect_moments`.
    pub fn opencl_source(&self) -> Result<String> {
        let mut src = String::new();
        write_opencl(&mut src, self)?;
        log::debug!("Emitted {} bytes of OpenCL C", src.len());
        Ok(src)
    }
}

/// Flat index offset of the cell at `-c`.
pub fn neighbor_offset(c: &[i32; 3], strides: [isize; 3]) -> isize {
    -(c[0] as isize * strides[0] + c[1] as isize * strides[1] + c[2] as isize * strides[2])
}

fn check_grid(descriptor: &Descriptor, grid: Grid) -> Result<()> {
    if grid.n_x == 0 || grid.n_y == 0 || grid.n_z == 0 {
        return Err(LbmError::InvalidGrid(format!(
            "{}x{}x{} has an empty axis",
            grid.n_x, grid.n_y, grid.n_z
        )));
    }
    if descriptor.dimensions() == 2 && grid.n_z != 1 {
        return Err(LbmError::InvalidGrid(format!(
            "{:?} is two-dimensional but n_z = {}",
            descriptor.velocity_set(),
            grid.n_z
        )));
    }
    if grid.volume() as u64 * descriptor.q() as u64 > i32::MAX as u64 {
        return Err(LbmError::InvalidGrid(format!(
            "{} cells x {} populations exceed the 32 bit index range",
            grid.volume(),
            descriptor.q()
        )));
    }
    Ok(())
}

fn c_float(v: f64) -> String {
    let s = format!("{:?}f", v as f32);
    if v < 0.0 {
        format!("({s})")
    } else {
        s
    }
}

/// Expression in OpenCL C syntax.
fn c_expr(e: &Expr) -> String {
    fn join(items: &[Expr], op: &str) -> String {
        let parts: Vec<String> = items.iter().map(c_expr).collect();
        format!("({})", parts.join(op))
    }
    match e {
        Expr::Const(v) => c_float(*v),
        Expr::Sym(s) => s.to_string(),
        Expr::Sum(v) => join(v, " + "),
        Expr::Product(v) => join(v, " * "),
        Expr::Div(a, b) => format!("({} / {})", c_expr(a), c_expr(b)),
        Expr::Min(a, b) => format!("fmin({}, {})", c_expr(a), c_expr(b)),
        Expr::Max(a, b) => format!("fmax({}, {})", c_expr(a), c_expr(b)),
    }
}

/// Helpers become constants, outputs stay mutable so boundary rules can rewrite them.
fn emit_block(src: &mut String, block: &Block, mutable_outputs: bool) -> fmt::Result {
    for a in block.statements() {
        let qualifier = match a.target {
            Symbol::Helper(..) => "const float",
            _ if mutable_outputs => "float",
            _ => "const float",
        };
        writeln!(src, "    {} {} = {};", qualifier, a.target, c_expr(&a.value))?;
    }
    Ok(())
}

fn emit_boundary(src: &mut String, rules: &[BoundaryRule]) -> fmt::Result {
    for rule in rules {
        let condition: Vec<String> = rule.materials.iter().map(|m| format!("m == {m}")).collect();
        writeln!(src, "    if ( {} ) {{", condition.join(" || "))?;
        for a in &rule.overrides {
            writeln!(src, "        {} = {};", a.target, c_expr(&a.value))?;
        }
        writeln!(src, "    }}")?;
    }
    Ok(())
}

fn write_opencl(src: &mut String, program: &KernelProgram) -> fmt::Result {
    let grid = program.grid;
    let n = grid.volume();
    let q = program.descriptor.q();

    writeln!(
        src,
        "// {:?} BGK lattice, {}x{}x{} cells, tau = {:?}",
        program.descriptor.velocity_set(),
        grid.n_x,
        grid.n_y,
        grid.n_z,
        program.tau
    )?;
    writeln!(src)?;

    // collide_and_stream
    writeln!(src, "__kernel void collide_and_stream(__global float* f_next,")?;
    writeln!(src, "                                 __global const float* f_prev,")?;
    writeln!(src, "                                 __global const int* material,")?;
    writeln!(src, "                                 const uint time)")?;
    writeln!(src, "{{")?;
    writeln!(src, "    const uint gid = get_global_id(0);")?;
    writeln!(src, "    if (gid >= {n}u) {{")?;
    writeln!(src, "        return;")?;
    writeln!(src, "    }}")?;
    writeln!(src, "    const int m = material[gid];")?;
    writeln!(src, "    if (m == {}) {{", material::GHOST)?;
    writeln!(src, "        return;")?;
    writeln!(src, "    }}")?;
    writeln!(src, "    __global const float* preshifted_f_prev = f_prev + gid;")?;
    for (i, offset) in program.stream_offsets.iter().enumerate() {
        writeln!(src, "    const float {} = preshifted_f_prev[{}];", Symbol::F(i), offset)?;
    }
    emit_block(src, &program.moments, true)?;
    emit_boundary(src, &program.boundary)?;
    emit_block(src, &program.collide, false)?;
    for i in 0..q {
        writeln!(src, "    f_next[{}u + gid] = {};", i * n, Symbol::FNext(i))?;
    }
    writeln!(src, "}}")?;
    writeln!(src)?;

    // collect_moments
    writeln!(src, "__kernel void collect_moments(__global const float* f,")?;
    writeln!(src, "                              __global float* moments)")?;
    writeln!(src, "{{")?;
    writeln!(src, "    const uint gid = get_global_id(0);")?;
    writeln!(src, "    if (gid >= {n}u) {{")?;
    writeln!(src, "        return;")?;
    writeln!(src, "    }}")?;
    writeln!(src, "    __global const float* preshifted_f = f + gid;")?;
    for i in 0..q {
        writeln!(src, "    const float {} = preshifted_f[{}];", Symbol::F(i), i * n)?;
    }
    emit_block(src, &program.moments, false)?;
    for (k, a) in program.moments.outputs().enumerate() {
        writeln!(src, "    moments[{}u + gid] = {};", k * n, a.target)?;
    }
    writeln!(src, "}}")
}
