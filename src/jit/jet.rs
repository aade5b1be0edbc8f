//! Jet function emission.
//!
//! The jet function fills the (order, u-index, lane)-strided buffer with
//! normalised Taylor coefficients, order by order: the caller populates
//! order 0 of the state variables, the function evaluates order 0 of the
//! intermediates, then for each order applies the terminal rule to the
//! state variables followed by the per-operator recurrences for the
//! intermediates. Everything is emitted as straight-line code; operand
//! coefficients that are statically zero (higher orders of numbers,
//! parameters and time) drop their product terms at emission time.
//!
//! Coefficient convention: `c[i][o]` is the o-th normalised coefficient of
//! u-variable i, `f^(o)(t0) / o!`.

use std::collections::HashMap;

use cranelift::prelude::{types, FunctionBuilder, InstBuilder, MemFlags, Type, Value};
use cranelift_codegen::ir::FuncRef;
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};

use crate::decompose::{uname_to_index, Decomposition};
use crate::error::Error;
use crate::expr::{BinOp, Expr};
use crate::float::MathSymbols;
use crate::jit::ModuleBuilder;

/// Emission context handed to the per-function Taylor recurrence hooks.
///
/// Wraps the function builder with the jet-buffer addressing scheme and the
/// imported math routines for the active float width and batch lane.
pub struct JetEmitter<'a, 'b> {
    bcx: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    math_ids: &'a HashMap<&'static str, FuncId>,
    func_refs: HashMap<&'static str, FuncRef>,
    ty: Type,
    syms: MathSymbols,
    jet_ptr: Value,
    pars_ptr: Value,
    time_ptr: Value,
    n_uvars: usize,
    batch: usize,
    lane: usize,
}

impl JetEmitter<'_, '_> {
    /// Math routine names for the active float width.
    pub(crate) fn syms(&self) -> MathSymbols {
        self.syms
    }

    pub(crate) fn fconst(&mut self, x: f64) -> Value {
        if self.ty == types::F32 {
            self.bcx.ins().f32const(x as f32)
        } else {
            self.bcx.ins().f64const(x)
        }
    }

    fn bytes(&self) -> usize {
        self.ty.bytes() as usize
    }

    fn jet_offset(&self, i: usize, o: u32) -> i32 {
        // Guarded against overflow when the module is compiled.
        (((o as usize * self.n_uvars + i) * self.batch + self.lane) * self.bytes()) as i32
    }

    /// Load the order-`o` coefficient of u-variable `i` on the active lane.
    pub(crate) fn load_u(&mut self, i: usize, o: u32) -> Value {
        let off = self.jet_offset(i, o);
        self.bcx
            .ins()
            .load(self.ty, MemFlags::trusted(), self.jet_ptr, off)
    }

    fn store_u(&mut self, i: usize, o: u32, v: Value) {
        let off = self.jet_offset(i, o);
        self.bcx
            .ins()
            .store(MemFlags::trusted(), v, self.jet_ptr, off);
    }

    /// The order-`o` coefficient of an operand, or `None` when it is
    /// statically zero.
    pub(crate) fn coeff(&mut self, e: &Expr, o: u32) -> Result<Option<Value>, Error> {
        match e {
            Expr::Var(name) => {
                let k = uname_to_index(name).ok_or_else(|| {
                    Error::Codegen(format!("operand '{}' is not a u-variable", name))
                })?;
                Ok(Some(self.load_u(k, o)))
            }
            Expr::Num(x) => Ok(if o == 0 { Some(self.fconst(*x)) } else { None }),
            Expr::Par(j) => Ok(if o == 0 {
                let off = ((*j as usize * self.batch + self.lane) * self.bytes()) as i32;
                Some(
                    self.bcx
                        .ins()
                        .load(self.ty, MemFlags::trusted(), self.pars_ptr, off),
                )
            } else {
                None
            }),
            Expr::Time => match o {
                0 => {
                    let off = (self.lane * self.bytes()) as i32;
                    Ok(Some(self.bcx.ins().load(
                        self.ty,
                        MemFlags::trusted(),
                        self.time_ptr,
                        off,
                    )))
                }
                1 => Ok(Some(self.fconst(1.0))),
                _ => Ok(None),
            },
            other => Err(Error::Codegen(format!(
                "non-elementary operand '{}'",
                other
            ))),
        }
    }

    pub(crate) fn coeff_or_zero(&mut self, e: &Expr, o: u32) -> Result<Value, Error> {
        match self.coeff(e, o)? {
            Some(v) => Ok(v),
            None => Ok(self.fconst(0.0)),
        }
    }

    /// Call an imported math routine.
    pub(crate) fn call_math(&mut self, sym: &'static str, args: &[Value]) -> Value {
        let fref = match self.func_refs.get(sym) {
            Some(&r) => r,
            None => {
                let id = self.math_ids[sym];
                let r = self.module.declare_func_in_func(id, self.bcx.func);
                self.func_refs.insert(sym, r);
                r
            }
        };
        let call = self.bcx.ins().call(fref, args);
        self.bcx.inst_results(call)[0]
    }

    fn fadd(&mut self, a: Value, b: Value) -> Value {
        self.bcx.ins().fadd(a, b)
    }

    fn fsub(&mut self, a: Value, b: Value) -> Value {
        self.bcx.ins().fsub(a, b)
    }

    fn fmul(&mut self, a: Value, b: Value) -> Value {
        self.bcx.ins().fmul(a, b)
    }

    fn fdiv(&mut self, a: Value, b: Value) -> Value {
        self.bcx.ins().fdiv(a, b)
    }

    fn fneg(&mut self, a: Value) -> Value {
        self.bcx.ins().fneg(a)
    }

    /// Fold a list of terms into their sum; `None` when there are none.
    fn sum(&mut self, terms: &[Value]) -> Option<Value> {
        let mut it = terms.iter().copied();
        let first = it.next()?;
        Some(it.fold(first, |acc, v| self.fadd(acc, v)))
    }

    fn sum_or_zero(&mut self, terms: &[Value]) -> Value {
        match self.sum(terms) {
            Some(v) => v,
            None => self.fconst(0.0),
        }
    }

    fn div_by_order(&mut self, v: Value, o: u32) -> Value {
        let k = self.fconst(o as f64);
        self.fdiv(v, k)
    }
}

/// Emit a jet function for a fixed order and batch width.
pub(crate) fn emit_jet(
    mb: &mut ModuleBuilder,
    name: &str,
    dc: &Decomposition,
    order: u32,
    batch: usize,
    ty: Type,
    syms: MathSymbols,
) -> Result<FuncId, Error> {
    let n = dc.n_eq();
    let len = dc.len();
    let entries = dc.entries();

    mb.define_fn3(name, |bcx, module, math_ids, [jet_ptr, pars_ptr, time_ptr]| {
        let mut em = JetEmitter {
            bcx,
            module,
            math_ids,
            func_refs: HashMap::new(),
            ty,
            syms,
            jet_ptr,
            pars_ptr,
            time_ptr,
            n_uvars: len,
            batch,
            lane: 0,
        };

        // Order 0 of the intermediates; the state values are already in
        // place, written by the caller.
        for i in n..len - n {
            for lane in 0..batch {
                em.lane = lane;
                let v = emit_entry(&mut em, i, &entries[i], 0)?;
                em.store_u(i, 0, v);
            }
        }

        for o in 1..=order {
            // Terminal rule: the tail entry at position len - n + i is
            // dx_i/dt, so x_i's normalised order-o coefficient is its
            // order-(o-1) coefficient divided by o.
            for i in 0..n {
                let tail = &entries[len - n + i];
                for lane in 0..batch {
                    em.lane = lane;
                    let v = match em.coeff(tail, o - 1)? {
                        Some(c) => em.div_by_order(c, o),
                        None => em.fconst(0.0),
                    };
                    em.store_u(i, o, v);
                }
            }

            for i in n..len - n {
                for lane in 0..batch {
                    em.lane = lane;
                    let v = emit_entry(&mut em, i, &entries[i], o)?;
                    em.store_u(i, o, v);
                }
            }
        }

        Ok(())
    })
}

/// The order-`o` coefficient of one intermediate entry.
fn emit_entry(em: &mut JetEmitter, idx: usize, entry: &Expr, o: u32) -> Result<Value, Error> {
    match entry {
        Expr::Bin(op, lhs, rhs) => emit_bin(em, idx, *op, lhs, rhs, o),
        Expr::Call(func) => (func.taylor_fn())(em, idx, func.args(), o),
        // A parameter entry is constant in time.
        Expr::Par(_) | Expr::Num(_) => match o {
            0 => em.coeff_or_zero(entry, 0),
            _ => Ok(em.fconst(0.0)),
        },
        // Time has the coefficients (t, 1, 0, 0, ...).
        Expr::Time => match o {
            0 | 1 => em.coeff_or_zero(entry, o),
            _ => Ok(em.fconst(0.0)),
        },
        other => Err(Error::Codegen(format!(
            "invalid decomposition entry '{}'",
            other
        ))),
    }
}

fn emit_bin(
    em: &mut JetEmitter,
    idx: usize,
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    o: u32,
) -> Result<Value, Error> {
    match op {
        BinOp::Add | BinOp::Sub => {
            let a = em.coeff(lhs, o)?;
            let b = em.coeff(rhs, o)?;
            Ok(match (a, b) {
                (Some(a), Some(b)) => {
                    if op == BinOp::Add {
                        em.fadd(a, b)
                    } else {
                        em.fsub(a, b)
                    }
                }
                (Some(a), None) => a,
                (None, Some(b)) => {
                    if op == BinOp::Add {
                        b
                    } else {
                        em.fneg(b)
                    }
                }
                (None, None) => em.fconst(0.0),
            })
        }
        // Cauchy product: c[o] = sum_{k=0..o} a[k] * b[o-k].
        BinOp::Mul => {
            let mut terms = Vec::new();
            for k in 0..=o {
                let a = em.coeff(lhs, k)?;
                let b = em.coeff(rhs, o - k)?;
                if let (Some(a), Some(b)) = (a, b) {
                    terms.push(em.fmul(a, b));
                }
            }
            Ok(em.sum_or_zero(&terms))
        }
        // c[o] = (a[o] - sum_{k=1..o} b[k] * c[o-k]) / b[0]. A zero b[0]
        // propagates as inf/NaN and is caught by the stepper's
        // finiteness check.
        BinOp::Div => {
            let a_o = em.coeff(lhs, o)?;
            let mut terms = Vec::new();
            for k in 1..=o {
                if let Some(b_k) = em.coeff(rhs, k)? {
                    let c = em.load_u(idx, o - k);
                    terms.push(em.fmul(b_k, c));
                }
            }
            let sub = em.sum(&terms);
            let numer = match (a_o, sub) {
                (Some(a), Some(s)) => em.fsub(a, s),
                (Some(a), None) => a,
                (None, Some(s)) => em.fneg(s),
                (None, None) => em.fconst(0.0),
            };
            let b_0 = em.coeff_or_zero(rhs, 0)?;
            Ok(em.fdiv(numer, b_0))
        }
    }
}

// ── Per-function Taylor recurrences ──
//
// These are the hooks registered on the elementary functions. Each produces
// the order-o coefficient of the u-variable at `idx` from lower-order data
// already present in the jet buffer.

/// sin placed at `idx`, with cos of the same argument at `idx + 1`:
/// `c[o] = (1/o) * sum_{k=1..o} k * cos[o-k] * a[k]`.
pub(crate) fn taylor_sin(
    em: &mut JetEmitter,
    idx: usize,
    args: &[Expr],
    o: u32,
) -> Result<Value, Error> {
    if o == 0 {
        let a0 = em.coeff_or_zero(&args[0], 0)?;
        let sym = em.syms().sin;
        return Ok(em.call_math(sym, &[a0]));
    }
    let mut terms = Vec::new();
    for k in 1..=o {
        if let Some(a_k) = em.coeff(&args[0], k)? {
            let cos_v = em.load_u(idx + 1, o - k);
            let kc = em.fconst(k as f64);
            let t = em.fmul(a_k, cos_v);
            terms.push(em.fmul(kc, t));
        }
    }
    let s = em.sum_or_zero(&terms);
    Ok(em.div_by_order(s, o))
}

/// cos placed at `idx`, with sin of the same argument at `idx - 1`:
/// `c[o] = -(1/o) * sum_{k=1..o} k * sin[o-k] * a[k]`.
pub(crate) fn taylor_cos(
    em: &mut JetEmitter,
    idx: usize,
    args: &[Expr],
    o: u32,
) -> Result<Value, Error> {
    if o == 0 {
        let a0 = em.coeff_or_zero(&args[0], 0)?;
        let sym = em.syms().cos;
        return Ok(em.call_math(sym, &[a0]));
    }
    let mut terms = Vec::new();
    for k in 1..=o {
        if let Some(a_k) = em.coeff(&args[0], k)? {
            let sin_v = em.load_u(idx - 1, o - k);
            let kc = em.fconst(k as f64);
            let t = em.fmul(a_k, sin_v);
            terms.push(em.fmul(kc, t));
        }
    }
    let s = em.sum_or_zero(&terms);
    let d = em.div_by_order(s, o);
    Ok(em.fneg(d))
}

/// `c[o] = (1/o) * sum_{k=1..o} k * a[k] * c[o-k]`.
pub(crate) fn taylor_exp(
    em: &mut JetEmitter,
    idx: usize,
    args: &[Expr],
    o: u32,
) -> Result<Value, Error> {
    if o == 0 {
        let a0 = em.coeff_or_zero(&args[0], 0)?;
        let sym = em.syms().exp;
        return Ok(em.call_math(sym, &[a0]));
    }
    let mut terms = Vec::new();
    for k in 1..=o {
        if let Some(a_k) = em.coeff(&args[0], k)? {
            let c = em.load_u(idx, o - k);
            let kc = em.fconst(k as f64);
            let t = em.fmul(a_k, c);
            terms.push(em.fmul(kc, t));
        }
    }
    let s = em.sum_or_zero(&terms);
    Ok(em.div_by_order(s, o))
}

/// `c[o] = (a[o] - (1/o) * sum_{k=1..o-1} k * c[k] * a[o-k]) / a[0]`.
pub(crate) fn taylor_log(
    em: &mut JetEmitter,
    idx: usize,
    args: &[Expr],
    o: u32,
) -> Result<Value, Error> {
    if o == 0 {
        let a0 = em.coeff_or_zero(&args[0], 0)?;
        let sym = em.syms().log;
        return Ok(em.call_math(sym, &[a0]));
    }
    let a_o = em.coeff(&args[0], o)?;
    let mut terms = Vec::new();
    for k in 1..o {
        if let Some(a_ok) = em.coeff(&args[0], o - k)? {
            let c_k = em.load_u(idx, k);
            let kc = em.fconst(k as f64);
            let t = em.fmul(c_k, a_ok);
            terms.push(em.fmul(kc, t));
        }
    }
    let inner = em.sum(&terms).map(|s| em.div_by_order(s, o));
    let numer = match (a_o, inner) {
        (Some(a), Some(s)) => em.fsub(a, s),
        (Some(a), None) => a,
        (None, Some(s)) => em.fneg(s),
        (None, None) => em.fconst(0.0),
    };
    let a_0 = em.coeff_or_zero(&args[0], 0)?;
    Ok(em.fdiv(numer, a_0))
}

/// `a^alpha` with a constant exponent:
/// `c[o] = (1/(o * a[0])) * sum_{k=0..o-1} (alpha*(o-k) - k) * a[o-k] * c[k]`.
pub(crate) fn taylor_pow(
    em: &mut JetEmitter,
    idx: usize,
    args: &[Expr],
    o: u32,
) -> Result<Value, Error> {
    let alpha = match &args[1] {
        Expr::Num(x) => *x,
        other => return Err(Error::UnsupportedExponent(other.to_string())),
    };
    if o == 0 {
        let a0 = em.coeff_or_zero(&args[0], 0)?;
        let e = em.fconst(alpha);
        let sym = em.syms().pow;
        return Ok(em.call_math(sym, &[a0, e]));
    }
    let mut terms = Vec::new();
    for k in 0..o {
        if let Some(a_ok) = em.coeff(&args[0], o - k)? {
            let c_k = em.load_u(idx, k);
            let factor = em.fconst(alpha * f64::from(o - k) - f64::from(k));
            let t = em.fmul(a_ok, c_k);
            terms.push(em.fmul(factor, t));
        }
    }
    let s = em.sum_or_zero(&terms);
    let a_0 = em.coeff_or_zero(&args[0], 0)?;
    let oc = em.fconst(o as f64);
    let denom = em.fmul(oc, a_0);
    Ok(em.fdiv(s, denom))
}

/// erf'(x) = (2/sqrt(pi)) * exp(-x²); the exponential's coefficients come
/// from the hidden-dependency u-variable recorded as the second argument:
/// `c[o] = (2/sqrt(pi)) * (1/o) * sum_{k=1..o} k * a[k] * g[o-k]`.
pub(crate) fn taylor_erf(
    em: &mut JetEmitter,
    _idx: usize,
    args: &[Expr],
    o: u32,
) -> Result<Value, Error> {
    if o == 0 {
        let a0 = em.coeff_or_zero(&args[0], 0)?;
        let sym = em.syms().erf;
        return Ok(em.call_math(sym, &[a0]));
    }
    let g = match &args[1] {
        Expr::Var(name) => uname_to_index(name).ok_or_else(|| {
            Error::Codegen(format!("hidden erf dependency '{}' is not a u-variable", name))
        })?,
        other => {
            return Err(Error::Codegen(format!(
                "hidden erf dependency '{}' is not a u-variable",
                other
            )))
        }
    };
    let mut terms = Vec::new();
    for k in 1..=o {
        if let Some(a_k) = em.coeff(&args[0], k)? {
            let g_v = em.load_u(g, o - k);
            let kc = em.fconst(k as f64);
            let t = em.fmul(a_k, g_v);
            terms.push(em.fmul(kc, t));
        }
    }
    let s = em.sum_or_zero(&terms);
    let d = em.div_by_order(s, o);
    let scale = em.fconst(std::f64::consts::FRAC_2_SQRT_PI);
    Ok(em.fmul(scale, d))
}
