//! # expr
//!
//! Expression tree used to describe moments, equilibria, collisions and boundary overrides
//! independently of any kernel language.
//!
//! Expressions are grouped into [`Block`]s of ordered assignments. A block can be simplified and
//! common subexpressions can be hoisted into helper assignments before it is lowered.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Block a helper temporary belongs to. Keeps helper names of different blocks apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Moments,
    Collide,
}

/// Variables an expression can refer to or a block can assign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Symbol {
    /// Population `i` as gathered before collision.
    F(usize),
    /// Population `i` after collision.
    FNext(usize),
    /// Density
    Rho,
    /// Velocity component `k`
    U(usize),
    /// Number of `evolve()` calls so far.
    Time,
    Helper(Stage, usize),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::F(i) => write!(f, "f_curr_{i}"),
            Symbol::FNext(i) => write!(f, "f_next_{i}"),
            Symbol::Rho => write!(f, "rho"),
            Symbol::U(k) => write!(f, "u_{k}"),
            Symbol::Time => write!(f, "time"),
            Symbol::Helper(Stage::Moments, n) => write!(f, "m_{n}"),
            Symbol::Helper(Stage::Collide, n) => write!(f, "c_{n}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Const(f64),
    Sym(Symbol),
    Sum(Vec<Expr>),
    Product(Vec<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn constant(value: f64) -> Expr {
        Expr::Const(value)
    }

    pub fn sym(symbol: Symbol) -> Expr {
        Expr::Sym(symbol)
    }

    pub fn sum<I: IntoIterator<Item = Expr>>(terms: I) -> Expr {
        Expr::Sum(terms.into_iter().collect())
    }

    pub fn product<I: IntoIterator<Item = Expr>>(factors: I) -> Expr {
        Expr::Product(factors.into_iter().collect())
    }

    pub fn min(a: Expr, b: Expr) -> Expr {
        Expr::Min(Box::new(a), Box::new(b))
    }

    pub fn max(a: Expr, b: Expr) -> Expr {
        Expr::Max(Box::new(a), Box::new(b))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Expr::Const(_) | Expr::Sym(_))
    }

    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(|c| c.size()).sum::<usize>()
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const(_) | Expr::Sym(_) => vec![],
            Expr::Sum(v) | Expr::Product(v) => v.iter().collect(),
            Expr::Div(a, b) | Expr::Min(a, b) | Expr::Max(a, b) => vec![a.as_ref(), b.as_ref()],
        }
    }

    /// Rebuilds this node with `f` applied to every direct child.
    pub fn map_children<F: FnMut(&Expr) -> Expr>(&self, mut f: F) -> Expr {
        match self {
            Expr::Const(_) | Expr::Sym(_) => self.clone(),
            Expr::Sum(v) => Expr::Sum(v.iter().map(&mut f).collect()),
            Expr::Product(v) => Expr::Product(v.iter().map(&mut f).collect()),
            Expr::Div(a, b) => Expr::Div(Box::new(f(a.as_ref())), Box::new(f(b.as_ref()))),
            Expr::Min(a, b) => Expr::Min(Box::new(f(a.as_ref())), Box::new(f(b.as_ref()))),
            Expr::Max(a, b) => Expr::Max(Box::new(f(a.as_ref())), Box::new(f(b.as_ref()))),
        }
    }

    /// Calls `f` for every symbol occurrence.
    pub fn visit_symbols<F: FnMut(Symbol)>(&self, f: &mut F) {
        match self {
            Expr::Sym(s) => f(*s),
            _ => {
                for c in self.children() {
                    c.visit_symbols(f);
                }
            }
        }
    }

    /// Replaces every occurrence of a symbol for which `f` returns `Some`.
    pub fn substitute<F: Fn(Symbol) -> Option<Expr>>(&self, f: &F) -> Expr {
        match self {
            Expr::Sym(s) => f(*s).unwrap_or_else(|| self.clone()),
            _ => self.map_children(|c| c.substitute(f)),
        }
    }

    /// Numeric value with symbols resolved by `env`.
    pub fn eval<F: Fn(Symbol) -> f64>(&self, env: &F) -> f64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Sym(s) => env(*s),
            Expr::Sum(v) => v.iter().map(|e| e.eval(env)).sum(),
            Expr::Product(v) => v.iter().map(|e| e.eval(env)).product(),
            Expr::Div(a, b) => a.eval(env) / b.eval(env),
            Expr::Min(a, b) => a.eval(env).min(b.eval(env)),
            Expr::Max(a, b) => a.eval(env).max(b.eval(env)),
        }
    }

    /// Flattens nested sums and products, folds constants and drops neutral elements.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Sym(_) => self.clone(),
            Expr::Sum(terms) => {
                let mut constant = 0.0;
                let mut rest = Vec::new();
                for t in terms.iter().map(|t| t.simplify()) {
                    match t {
                        Expr::Const(v) => constant += v,
                        Expr::Sum(inner) => {
                            for i in inner {
                                match i {
                                    Expr::Const(v) => constant += v,
                                    other => rest.push(other),
                                }
                            }
                        }
                        other => rest.push(other),
                    }
                }
                if constant != 0.0 {
                    rest.push(Expr::Const(constant));
                }
                match rest.len() {
                    0 => Expr::Const(0.0),
                    1 => rest.remove(0),
                    _ => Expr::Sum(rest),
                }
            }
            Expr::Product(factors) => {
                let mut constant = 1.0;
                let mut rest = Vec::new();
                for t in factors.iter().map(|t| t.simplify()) {
                    match t {
                        Expr::Const(v) => constant *= v,
                        Expr::Product(inner) => {
                            for i in inner {
                                match i {
                                    Expr::Const(v) => constant *= v,
                                    other => rest.push(other),
                                }
                            }
                        }
                        other => rest.push(other),
                    }
                }
                if constant == 0.0 {
                    return Expr::Const(0.0);
                }
                if constant != 1.0 {
                    rest.insert(0, Expr::Const(constant));
                }
                match rest.len() {
                    0 => Expr::Const(1.0),
                    1 => rest.remove(0),
                    _ => Expr::Product(rest),
                }
            }
            Expr::Div(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                match (a.as_const(), b.as_const()) {
                    (Some(x), Some(y)) => Expr::Const(x / y),
                    (Some(x), _) if x == 0.0 => Expr::Const(0.0),
                    (_, Some(y)) if y == 1.0 => a,
                    _ => Expr::Div(Box::new(a), Box::new(b)),
                }
            }
            Expr::Min(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                match (a.as_const(), b.as_const()) {
                    (Some(x), Some(y)) => Expr::Const(x.min(y)),
                    _ => Expr::min(a, b),
                }
            }
            Expr::Max(a, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                match (a.as_const(), b.as_const()) {
                    (Some(x), Some(y)) => Expr::Const(x.max(y)),
                    _ => Expr::max(a, b),
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Expr], op: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, e) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{e}")?;
            }
            write!(f, ")")
        }
        match self {
            Expr::Const(v) => write!(f, "{v:?}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Sum(v) => join(f, v, "+"),
            Expr::Product(v) => join(f, v, "*"),
            Expr::Div(a, b) => write!(f, "({a} / {b})"),
            Expr::Min(a, b) => write!(f, "min({a}, {b})"),
            Expr::Max(a, b) => write!(f, "max({a}, {b})"),
        }
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Expr {
        Expr::Const(v)
    }
}

impl From<Symbol> for Expr {
    fn from(s: Symbol) -> Expr {
        Expr::Sym(s)
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::Sum(vec![self, rhs])
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sum(vec![self, -rhs])
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Product(vec![self, rhs])
    }
}

impl Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::Div(Box::new(self), Box::new(rhs))
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Product(vec![Expr::Const(-1.0), self])
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Assignment {
    pub target: Symbol,
    pub value: Expr,
}

impl Assignment {
    pub fn new(target: Symbol, value: Expr) -> Assignment {
        Assignment { target, value }
    }
}

/// Ordered list of assignments. Helper temporaries are interleaved right before their first use.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    statements: Vec<Assignment>,
}

impl Block {
    pub fn new(statements: Vec<Assignment>) -> Block {
        Block { statements }
    }

    pub fn statements(&self) -> &[Assignment] {
        &self.statements
    }

    /// Assignments to non-helper symbols.
    pub fn outputs(&self) -> impl Iterator<Item = &Assignment> {
        self.statements
            .iter()
            .filter(|a| !matches!(a.target, Symbol::Helper(..)))
    }

    pub fn helper_count(&self) -> usize {
        self.statements.len() - self.outputs().count()
    }

    /// Total node count of all right-hand sides.
    pub fn size(&self) -> usize {
        self.statements.iter().map(|a| a.value.size()).sum()
    }

    pub fn simplify(&self) -> Block {
        Block::new(
            self.statements
                .iter()
                .map(|a| Assignment::new(a.target, a.value.simplify()))
                .collect(),
        )
    }

    /// Hoists every compound subexpression that occurs more than once into a helper assignment.
    pub fn cse(&self, stage: Stage) -> Block {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for a in &self.statements {
            count_subtrees(&a.value, &mut counts);
        }

        let mut table: HashMap<String, Symbol> = HashMap::new();
        let mut statements = Vec::new();
        for a in &self.statements {
            let value = hoist(&a.value, &counts, &mut table, &mut statements, stage);
            statements.push(Assignment::new(a.target, value));
        }
        Block { statements }
    }
}

fn count_subtrees(expr: &Expr, counts: &mut HashMap<String, usize>) {
    if expr.is_leaf() {
        return;
    }
    let seen = counts.entry(expr.to_string()).or_insert(0);
    *seen += 1;
    // children of a repeated subtree were counted on its first occurrence
    if *seen == 1 {
        for c in expr.children() {
            count_subtrees(c, counts);
        }
    }
}

fn hoist(
    expr: &Expr,
    counts: &HashMap<String, usize>,
    table: &mut HashMap<String, Symbol>,
    statements: &mut Vec<Assignment>,
    stage: Stage,
) -> Expr {
    if expr.is_leaf() {
        return expr.clone();
    }
    let key = expr.to_string();
    if let Some(s) = table.get(&key) {
        return Expr::Sym(*s);
    }
    let rebuilt = expr.map_children(|c| hoist(c, counts, table, statements, stage));
    if counts.get(&key).copied().unwrap_or(0) > 1 {
        let symbol = Symbol::Helper(stage, table.len());
        statements.push(Assignment::new(symbol, rebuilt));
        table.insert(key, symbol);
        Expr::Sym(symbol)
    } else {
        rebuilt
    }
}
