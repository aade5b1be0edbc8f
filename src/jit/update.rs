//! State-update function emission.
//!
//! For each state variable the update function evaluates the Taylor
//! polynomial `p(h) = sum_{o=0..order} c[o] * h^o` with Estrin's scheme:
//! adjacent coefficients are paired as `a + b*h`, then the pass repeats on
//! the halved list with `h` squared, giving a log-depth dependency chain.
//! Since `c[0]` is the current state, `p(h)` is the updated state and is
//! stored directly.

use cranelift::prelude::{FunctionBuilder, InstBuilder, MemFlags, Type, Value};
use cranelift_module::FuncId;

use crate::error::Error;
use crate::jit::ModuleBuilder;

pub(crate) fn emit_update(
    mb: &mut ModuleBuilder,
    name: &str,
    n_eq: usize,
    n_uvars: usize,
    order: u32,
    batch: usize,
    ty: Type,
) -> Result<FuncId, Error> {
    let bytes = ty.bytes() as usize;
    mb.define_fn3(name, |bcx, _module, _math_ids, [out_ptr, jet_ptr, h_ptr]| {
        for lane in 0..batch {
            let h = bcx.ins().load(
                ty,
                MemFlags::trusted(),
                h_ptr,
                (lane * bytes) as i32,
            );
            for i in 0..n_eq {
                let coeffs: Vec<Value> = (0..=order as usize)
                    .map(|o| {
                        let off = (((o * n_uvars + i) * batch + lane) * bytes) as i32;
                        bcx.ins().load(ty, MemFlags::trusted(), jet_ptr, off)
                    })
                    .collect();
                let p = estrin(bcx, coeffs, h);
                let off = ((i * batch + lane) * bytes) as i32;
                bcx.ins().store(MemFlags::trusted(), p, out_ptr, off);
            }
        }
        Ok(())
    })
}

/// Estrin evaluation of a polynomial given its coefficient values and `h`.
fn estrin(bcx: &mut FunctionBuilder, mut level: Vec<Value>, h: Value) -> Value {
    let mut hh = h;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut chunks = level.chunks_exact(2);
        for pair in &mut chunks {
            let t = bcx.ins().fmul(pair[1], hh);
            next.push(bcx.ins().fadd(pair[0], t));
        }
        if let [last] = chunks.remainder() {
            next.push(*last);
        }
        level = next;
        if level.len() > 1 {
            hh = bcx.ins().fmul(hh, hh);
        }
    }
    level[0]
}
