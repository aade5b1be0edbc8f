//! Symbolic differentiation.

use crate::expr::{BinOp, Expr};

/// Partial derivative of `e` with respect to the variable named `s`.
///
/// Numbers, parameters and the time placeholder differentiate to zero; a
/// variable differentiates to one iff its name matches. Binary nodes follow
/// the sum/difference/product/quotient rules; calls delegate to the
/// function's derivative hook, which returns a closed-form expression.
pub fn diff(e: &Expr, s: &str) -> Expr {
    match e {
        Expr::Num(_) | Expr::Par(_) | Expr::Time => Expr::Num(0.0),
        Expr::Var(name) => {
            if name == s {
                Expr::Num(1.0)
            } else {
                Expr::Num(0.0)
            }
        }
        Expr::Bin(op, lhs, rhs) => {
            let (l, r) = (lhs.as_ref(), rhs.as_ref());
            match op {
                BinOp::Add => diff(l, s) + diff(r, s),
                BinOp::Sub => diff(l, s) - diff(r, s),
                BinOp::Mul => l.clone() * diff(r, s) + diff(l, s) * r.clone(),
                BinOp::Div => {
                    (diff(l, s) * r.clone() - l.clone() * diff(r, s)) / (r.clone() * r.clone())
                }
            }
        }
        Expr::Call(func) => (func.diff_fn())(func.args(), s),
    }
}
