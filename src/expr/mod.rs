//! Symbolic expression algebra.
//!
//! [`Expr`] is an immutable DAG over numeric literals, state variables,
//! runtime parameters, the time placeholder, the four arithmetic binary
//! operators and registered function calls. Copy is structural, equality is
//! structural, hashing is structural; shared subtrees are allowed but never
//! required.
//!
//! Construction goes through the exported builders ([`num`], [`var`],
//! [`par`], [`time`], the registered functions in [`func`]) and the standard
//! operator impls. The only algebraic rewriting performed on construction is
//! the identity/absorbing table documented on [`Expr::bin`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

mod diff;
mod eval;
pub mod func;
#[cfg(feature = "serde")]
mod serde_support;

pub use diff::diff;
pub use eval::{eval, eval_batch};
pub use func::Func;

/// Binary operator kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        })
    }
}

/// A node of the expression DAG.
///
/// Children are owned. Two expressions compare equal iff their variant tags
/// and all children compare equal recursively; numeric literals compare by
/// bit pattern so that equality and hashing agree.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr {
    /// Numeric literal.
    Num(f64),
    /// Named state variable.
    Var(String),
    /// Runtime parameter, identified by its index in the parameter vector.
    Par(u32),
    /// The independent (time) variable.
    Time,
    /// Binary arithmetic node.
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// Call of a registered function.
    Call(Func),
}

/// Numeric literal builder.
#[inline]
pub fn num(x: f64) -> Expr {
    Expr::Num(x)
}

/// State variable builder.
#[inline]
pub fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

/// Runtime parameter builder.
#[inline]
pub fn par(index: u32) -> Expr {
    Expr::Par(index)
}

/// Time placeholder builder.
#[inline]
pub fn time() -> Expr {
    Expr::Time
}

impl From<f64> for Expr {
    #[inline]
    fn from(x: f64) -> Self {
        Expr::Num(x)
    }
}

#[inline]
fn is_zero(e: &Expr) -> bool {
    matches!(e, Expr::Num(x) if *x == 0.0)
}

#[inline]
fn is_one(e: &Expr) -> bool {
    matches!(e, Expr::Num(x) if *x == 1.0)
}

impl Expr {
    /// Construct a binary node, applying the construction-time identities:
    ///
    /// `0 + e = e`, `e + 0 = e`, `0 - e = -e`, `e - 0 = e`,
    /// `0 * e = 0 = e * 0`, `1 * e = e = e * 1`, `0 / e = 0`.
    ///
    /// No other rewriting happens here.
    pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        match op {
            BinOp::Add => {
                if is_zero(&lhs) {
                    return rhs;
                }
                if is_zero(&rhs) {
                    return lhs;
                }
            }
            BinOp::Sub => {
                if is_zero(&rhs) {
                    return lhs;
                }
                if is_zero(&lhs) {
                    return -rhs;
                }
            }
            BinOp::Mul => {
                if is_zero(&lhs) || is_zero(&rhs) {
                    return Expr::Num(0.0);
                }
                if is_one(&lhs) {
                    return rhs;
                }
                if is_one(&rhs) {
                    return lhs;
                }
            }
            BinOp::Div => {
                if is_zero(&lhs) {
                    return Expr::Num(0.0);
                }
            }
        }
        Expr::Bin(op, Box::new(lhs), Box::new(rhs))
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::bin(BinOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::bin(BinOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::bin(BinOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::bin(BinOp::Div, self, rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        match self {
            Expr::Num(x) => Expr::Num(-x),
            e => Expr::bin(BinOp::Mul, Expr::Num(-1.0), e),
        }
    }
}

// Mixed-operand arithmetic with plain floats, on both sides.
macro_rules! impl_f64_ops {
    ($($trait:ident, $method:ident, $op:expr;)*) => {$(
        impl std::ops::$trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::bin($op, self, Expr::Num(rhs))
            }
        }
        impl std::ops::$trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::bin($op, Expr::Num(self), rhs)
            }
        }
    )*};
}

impl_f64_ops! {
    Add, add, BinOp::Add;
    Sub, sub, BinOp::Sub;
    Mul, mul, BinOp::Mul;
    Div, div, BinOp::Div;
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Num(a), Expr::Num(b)) => a.to_bits() == b.to_bits(),
            (Expr::Var(a), Expr::Var(b)) => a == b,
            (Expr::Par(a), Expr::Par(b)) => a == b,
            (Expr::Time, Expr::Time) => true,
            (Expr::Bin(op_a, la, ra), Expr::Bin(op_b, lb, rb)) => {
                op_a == op_b && la == lb && ra == rb
            }
            (Expr::Call(a), Expr::Call(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Expr::Num(x) => x.to_bits().hash(state),
            Expr::Var(name) => name.hash(state),
            Expr::Par(index) => index.hash(state),
            Expr::Time => {}
            Expr::Bin(op, lhs, rhs) => {
                op.hash(state);
                lhs.hash(state);
                rhs.hash(state);
            }
            Expr::Call(f) => f.hash(state),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(x) => write!(f, "{}", x),
            Expr::Var(name) => f.write_str(name),
            Expr::Par(index) => write!(f, "par[{}]", index),
            Expr::Time => f.write_str("t"),
            Expr::Bin(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op, rhs),
            Expr::Call(func) => func.fmt(f),
        }
    }
}

/// Replace every variable occurrence by its mapped expression.
///
/// Variables missing from the map are left untouched. The recursion is
/// purely structural; no simplification is applied to the result.
pub fn subs(e: &Expr, map: &HashMap<String, Expr>) -> Expr {
    match e {
        Expr::Var(name) => match map.get(name) {
            Some(repl) => repl.clone(),
            None => e.clone(),
        },
        Expr::Bin(op, lhs, rhs) => {
            Expr::Bin(*op, Box::new(subs(lhs, map)), Box::new(subs(rhs, map)))
        }
        Expr::Call(func) => {
            let mut func = func.clone();
            for arg in func.args_mut() {
                *arg = subs(arg, map);
            }
            Expr::Call(func)
        }
        _ => e.clone(),
    }
}

/// Sorted, duplicate-free list of the variable names reachable in `e`.
pub fn get_variables(e: &Expr) -> Vec<String> {
    let mut set = HashSet::new();
    collect_variables(e, &mut set);
    let mut vars: Vec<String> = set.into_iter().collect();
    vars.sort();
    vars
}

fn collect_variables(e: &Expr, out: &mut HashSet<String>) {
    match e {
        Expr::Var(name) => {
            out.insert(name.clone());
        }
        Expr::Bin(_, lhs, rhs) => {
            collect_variables(lhs, out);
            collect_variables(rhs, out);
        }
        Expr::Call(func) => {
            for arg in func.args() {
                collect_variables(arg, out);
            }
        }
        _ => {}
    }
}

/// Rewrite variable names in place using `map`; unmapped names are kept.
pub fn rename_variables(e: &mut Expr, map: &HashMap<String, String>) {
    match e {
        Expr::Var(name) => {
            if let Some(new_name) = map.get(name) {
                *name = new_name.clone();
            }
        }
        Expr::Bin(_, lhs, rhs) => {
            rename_variables(lhs, map);
            rename_variables(rhs, map);
        }
        Expr::Call(func) => {
            for arg in func.args_mut() {
                rename_variables(arg, map);
            }
        }
        _ => {}
    }
}

/// Number of parameter slots referenced by `e` (max index + 1, 0 if none).
pub fn param_count(e: &Expr) -> usize {
    match e {
        Expr::Par(index) => *index as usize + 1,
        Expr::Bin(_, lhs, rhs) => param_count(lhs).max(param_count(rhs)),
        Expr::Call(func) => func.args().iter().map(param_count).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::func::{cos, exp, sin};
    use super::*;

    #[test]
    fn construction_identities() {
        let x = var("x");
        assert_eq!(num(0.0) + x.clone(), x);
        assert_eq!(x.clone() + num(0.0), x);
        assert_eq!(x.clone() - num(0.0), x);
        assert_eq!(num(0.0) * x.clone(), num(0.0));
        assert_eq!(x.clone() * num(0.0), num(0.0));
        assert_eq!(num(1.0) * x.clone(), x);
        assert_eq!(x.clone() * num(1.0), x);
        assert_eq!(num(0.0) / x.clone(), num(0.0));
        assert_eq!(num(0.0) - x.clone(), num(-1.0) * x.clone());
        assert_eq!(-num(3.0), num(-3.0));
    }

    #[test]
    fn structural_equality_and_hash() {
        use std::collections::hash_map::DefaultHasher;

        let a = sin(var("x") + var("y"));
        let b = sin(var("x") + var("y"));
        let c = cos(var("x") + var("y"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let hash = |e: &Expr| {
            let mut h = DefaultHasher::new();
            e.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn variables_are_sorted_and_deduped() {
        let e = var("z") * var("a") + sin(var("z")) - var("m");
        assert_eq!(get_variables(&e), vec!["a", "m", "z"]);
    }

    #[test]
    fn subs_replaces_structurally() {
        let e = var("x") * var("x") + var("y");
        let mut map = HashMap::new();
        map.insert("x".to_string(), var("y") + num(1.0));
        let r = subs(&e, &map);
        let y1 = var("y") + num(1.0);
        assert_eq!(r, y1.clone() * y1 + var("y"));
    }

    #[test]
    fn rename_descends_into_calls() {
        let mut e = exp(var("x")) / var("y");
        let mut map = HashMap::new();
        map.insert("x".to_string(), "u_0".to_string());
        map.insert("y".to_string(), "u_1".to_string());
        rename_variables(&mut e, &map);
        assert_eq!(e, exp(var("u_0")) / var("u_1"));
    }

    #[test]
    fn display_round_trips_shape() {
        let e = (var("x") + num(1.0)) * sin(var("y"));
        assert_eq!(e.to_string(), "((x + 1) * sin(y))");
        assert_eq!(par(2).to_string(), "par[2]");
        assert_eq!(time().to_string(), "t");
    }

    #[test]
    fn param_count_is_max_index_plus_one() {
        let e = par(3) * var("x") + exp(par(1));
        assert_eq!(param_count(&e), 4);
        assert_eq!(param_count(&var("x")), 0);
    }
}
