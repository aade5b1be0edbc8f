//! Registered elementary functions.
//!
//! A [`Func`] node owns its display name, the argument expressions, and four
//! typed hooks: the symbolic derivative, the numeric evaluator, the Taylor
//! recurrence emitter and the decomposition routine. The hooks are plain
//! function pointers wired up in a static registry; equality and hashing
//! compare only the display name and the argument structure.

use std::fmt;
use std::hash::{Hash, Hasher};

use cranelift::prelude::Value;

use crate::decompose::{decompose_in_place, decompose_operand, uvar};
use crate::error::Error;
use crate::expr::{diff, num, Expr};
use crate::jit::jet::{self, JetEmitter};

/// Symbolic derivative of a call, given its arguments and the
/// differentiation variable.
pub(crate) type DiffFn = fn(&[Expr], &str) -> Expr;

/// Numeric evaluation over already-evaluated argument values.
pub(crate) type EvalFn = fn(&[f64]) -> f64;

/// Decomposition hook: lowers the call (arguments included) onto the
/// u-variable list and returns the index of the entry representing it.
/// This is where hidden dependencies are appended.
pub(crate) type DecomposeFn = fn(Func, &mut Vec<Expr>) -> usize;

/// Taylor recurrence emitter: produces the order-`o` coefficient value for
/// the u-variable at the given index.
pub(crate) type TaylorFn =
    fn(&mut JetEmitter<'_, '_>, usize, &[Expr], u32) -> Result<Value, Error>;

/// A call of a registered elementary function.
#[derive(Clone)]
pub struct Func {
    name: &'static str,
    args: Vec<Expr>,
    diff_fn: DiffFn,
    eval_fn: EvalFn,
    decompose_fn: DecomposeFn,
    taylor_fn: TaylorFn,
}

impl Func {
    /// Display name of the function.
    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    /// The argument expressions.
    ///
    /// Inside a decomposition, entries may carry extra hidden-dependency
    /// arguments appended after the user-visible ones (`erf` carries the
    /// u-variable holding `exp(-arg²)` as a second argument).
    #[inline]
    pub fn args(&self) -> &[Expr] {
        &self.args
    }

    #[inline]
    pub(crate) fn args_mut(&mut self) -> &mut Vec<Expr> {
        &mut self.args
    }

    #[inline]
    pub(crate) fn diff_fn(&self) -> DiffFn {
        self.diff_fn
    }

    #[inline]
    pub(crate) fn eval_fn(&self) -> EvalFn {
        self.eval_fn
    }

    #[inline]
    pub(crate) fn decompose_fn(&self) -> DecomposeFn {
        self.decompose_fn
    }

    #[inline]
    pub(crate) fn taylor_fn(&self) -> TaylorFn {
        self.taylor_fn
    }

    /// Rebuild a call from its display name, restoring the hooks from the
    /// registry. Returns `None` for unknown names.
    pub(crate) fn from_name(name: &str, args: Vec<Expr>) -> Option<Func> {
        REGISTRY
            .iter()
            .find(|hooks| hooks.name == name)
            .map(|hooks| hooks.call(args))
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.args == other.args
    }
}

impl Eq for Func {}

impl Hash for Func {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.args.hash(state);
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

// ── Registry ──

struct Hooks {
    name: &'static str,
    diff_fn: DiffFn,
    eval_fn: EvalFn,
    decompose_fn: DecomposeFn,
    taylor_fn: TaylorFn,
}

impl Hooks {
    fn call(&self, args: Vec<Expr>) -> Func {
        Func {
            name: self.name,
            args,
            diff_fn: self.diff_fn,
            eval_fn: self.eval_fn,
            decompose_fn: self.decompose_fn,
            taylor_fn: self.taylor_fn,
        }
    }
}

static REGISTRY: &[Hooks] = &[
    Hooks {
        name: "sin",
        diff_fn: sin_diff,
        eval_fn: |args| args[0].sin(),
        decompose_fn: sin_decompose,
        taylor_fn: jet::taylor_sin,
    },
    Hooks {
        name: "cos",
        diff_fn: cos_diff,
        eval_fn: |args| args[0].cos(),
        decompose_fn: cos_decompose,
        taylor_fn: jet::taylor_cos,
    },
    Hooks {
        name: "exp",
        diff_fn: exp_diff,
        eval_fn: |args| args[0].exp(),
        decompose_fn: default_decompose,
        taylor_fn: jet::taylor_exp,
    },
    Hooks {
        name: "log",
        diff_fn: log_diff,
        eval_fn: |args| args[0].ln(),
        decompose_fn: default_decompose,
        taylor_fn: jet::taylor_log,
    },
    Hooks {
        name: "pow",
        diff_fn: pow_diff,
        eval_fn: |args| args[0].powf(args[1]),
        decompose_fn: default_decompose,
        taylor_fn: jet::taylor_pow,
    },
    Hooks {
        name: "erf",
        diff_fn: erf_diff,
        eval_fn: |args| libm::erf(args[0]),
        decompose_fn: erf_decompose,
        taylor_fn: jet::taylor_erf,
    },
];

fn registered(name: &str, args: Vec<Expr>) -> Func {
    REGISTRY
        .iter()
        .find(|hooks| hooks.name == name)
        .map(|hooks| hooks.call(args))
        .unwrap_or_else(|| unreachable!("unregistered function '{}'", name))
}

// ── Builders ──

/// Sine.
pub fn sin(e: Expr) -> Expr {
    Expr::Call(registered("sin", vec![e]))
}

/// Cosine.
pub fn cos(e: Expr) -> Expr {
    Expr::Call(registered("cos", vec![e]))
}

/// Natural exponential.
pub fn exp(e: Expr) -> Expr {
    Expr::Call(registered("exp", vec![e]))
}

/// Natural logarithm.
pub fn log(e: Expr) -> Expr {
    Expr::Call(registered("log", vec![e]))
}

/// Exponentiation `base^expo`.
///
/// The Taylor recurrence supports a constant exponent only; a non-constant
/// exponent is rejected when the system is compiled.
pub fn pow(base: Expr, expo: impl Into<Expr>) -> Expr {
    Expr::Call(registered("pow", vec![base, expo.into()]))
}

/// Square root, expressed as `pow(e, 1/2)`.
pub fn sqrt(e: Expr) -> Expr {
    pow(e, num(0.5))
}

/// Error function.
pub fn erf(e: Expr) -> Expr {
    Expr::Call(registered("erf", vec![e]))
}

// ── Derivative hooks ──

fn sin_diff(args: &[Expr], s: &str) -> Expr {
    cos(args[0].clone()) * diff(&args[0], s)
}

fn cos_diff(args: &[Expr], s: &str) -> Expr {
    -(sin(args[0].clone()) * diff(&args[0], s))
}

fn exp_diff(args: &[Expr], s: &str) -> Expr {
    exp(args[0].clone()) * diff(&args[0], s)
}

fn log_diff(args: &[Expr], s: &str) -> Expr {
    diff(&args[0], s) / args[0].clone()
}

fn pow_diff(args: &[Expr], s: &str) -> Expr {
    let (base, expo) = (args[0].clone(), args[1].clone());
    expo.clone() * pow(base.clone(), expo.clone() - num(1.0)) * diff(&args[0], s)
        + pow(base.clone(), expo) * log(base) * diff(&args[1], s)
}

fn erf_diff(args: &[Expr], s: &str) -> Expr {
    let a = args[0].clone();
    num(std::f64::consts::FRAC_2_SQRT_PI) * exp(-(a.clone() * a)) * diff(&args[0], s)
}

// ── Decomposition hooks ──

/// Decompose every argument, then append the call itself.
fn default_decompose(mut f: Func, dc: &mut Vec<Expr>) -> usize {
    for arg in f.args_mut() {
        let ex = std::mem::replace(arg, Expr::Num(0.0));
        *arg = decompose_operand(ex, dc);
    }
    dc.push(Expr::Call(f));
    dc.len() - 1
}

/// The sine/cosine recurrences are coupled, so both are always present in
/// the decomposition: the sine sits first, the cosine of the same argument
/// directly after it.
fn sin_decompose(mut f: Func, dc: &mut Vec<Expr>) -> usize {
    let arg = std::mem::replace(&mut f.args_mut()[0], Expr::Num(0.0));
    let arg = decompose_operand(arg, dc);
    f.args_mut()[0] = arg.clone();
    dc.push(Expr::Call(f));
    let sin_idx = dc.len() - 1;
    dc.push(cos(arg));
    sin_idx
}

fn cos_decompose(mut f: Func, dc: &mut Vec<Expr>) -> usize {
    let arg = std::mem::replace(&mut f.args_mut()[0], Expr::Num(0.0));
    let arg = decompose_operand(arg, dc);
    f.args_mut()[0] = arg.clone();
    dc.push(sin(arg));
    dc.push(Expr::Call(f));
    dc.len() - 1
}

/// erf'(x) = (2/√π)·exp(-x²): the recurrence needs the Taylor coefficients
/// of exp(-x²), so the hook lowers that quantity first and records its
/// u-index as an extra hidden argument on the erf entry. The hidden
/// reference (rather than a positional convention) is what keeps the
/// recurrence intact when CSE merges the auxiliary with a user-written
/// occurrence of the same exponential.
fn erf_decompose(mut f: Func, dc: &mut Vec<Expr>) -> usize {
    let arg = std::mem::replace(&mut f.args_mut()[0], Expr::Num(0.0));
    let arg = decompose_operand(arg, dc);
    f.args_mut()[0] = arg.clone();
    let aux = exp(-(arg.clone() * arg));
    let g_idx = decompose_in_place(aux, dc);
    f.args_mut().push(uvar(g_idx));
    dc.push(Expr::Call(f));
    dc.len() - 1
}
