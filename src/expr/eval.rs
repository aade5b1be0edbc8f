//! Interpreted numerical evaluation.

use std::collections::HashMap;

use crate::error::Error;
use crate::expr::{BinOp, Expr};

/// Evaluate `e` over a variable→value mapping, a parameter vector and a
/// time value.
///
/// Fails with [`Error::UnboundVariable`] when a variable is missing from
/// the mapping and with [`Error::ParamOutOfRange`] when a parameter index
/// exceeds the parameter vector; evaluation is never retried.
pub fn eval(
    e: &Expr,
    vars: &HashMap<String, f64>,
    pars: &[f64],
    t: f64,
) -> Result<f64, Error> {
    match e {
        Expr::Num(x) => Ok(*x),
        Expr::Var(name) => vars
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnboundVariable(name.clone())),
        Expr::Par(index) => {
            let index = *index as usize;
            pars.get(index).copied().ok_or(Error::ParamOutOfRange {
                index,
                len: pars.len(),
            })
        }
        Expr::Time => Ok(t),
        Expr::Bin(op, lhs, rhs) => {
            let l = eval(lhs, vars, pars, t)?;
            let r = eval(rhs, vars, pars, t)?;
            Ok(match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
            })
        }
        Expr::Call(func) => {
            let mut args = Vec::with_capacity(func.args().len());
            for arg in func.args() {
                args.push(eval(arg, vars, pars, t)?);
            }
            Ok((func.eval_fn())(&args))
        }
    }
}

/// Evaluate `e` over column vectors of bindings, one output per column.
///
/// All columns (variable bindings and the time vector) must have the length
/// of `out`.
pub fn eval_batch(
    out: &mut [f64],
    e: &Expr,
    vars: &HashMap<String, Vec<f64>>,
    pars: &[f64],
    ts: &[f64],
) -> Result<(), Error> {
    match e {
        Expr::Num(x) => out.fill(*x),
        Expr::Var(name) => {
            let col = vars
                .get(name)
                .ok_or_else(|| Error::UnboundVariable(name.clone()))?;
            out.copy_from_slice(&col[..out.len()]);
        }
        Expr::Par(index) => {
            let index = *index as usize;
            let v = pars.get(index).copied().ok_or(Error::ParamOutOfRange {
                index,
                len: pars.len(),
            })?;
            out.fill(v);
        }
        Expr::Time => out.copy_from_slice(&ts[..out.len()]),
        Expr::Bin(op, lhs, rhs) => {
            eval_batch(out, lhs, vars, pars, ts)?;
            let mut tmp = vec![0.0; out.len()];
            eval_batch(&mut tmp, rhs, vars, pars, ts)?;
            for (o, r) in out.iter_mut().zip(tmp) {
                match op {
                    BinOp::Add => *o += r,
                    BinOp::Sub => *o -= r,
                    BinOp::Mul => *o *= r,
                    BinOp::Div => *o /= r,
                }
            }
        }
        Expr::Call(func) => {
            let n_args = func.args().len();
            let mut cols = vec![vec![0.0; out.len()]; n_args];
            for (col, arg) in cols.iter_mut().zip(func.args()) {
                eval_batch(col, arg, vars, pars, ts)?;
            }
            let eval_fn = func.eval_fn();
            let mut point = vec![0.0; n_args];
            for (i, o) in out.iter_mut().enumerate() {
                for (p, col) in point.iter_mut().zip(&cols) {
                    *p = col[i];
                }
                *o = eval_fn(&point);
            }
        }
    }
    Ok(())
}
