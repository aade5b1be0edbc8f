use std::fmt::{Debug, Display};

use cranelift::prelude::{types, Type};
use num_traits::{Float as NumFloat, FloatConst, FromPrimitive};

/// Marker trait for base floating-point types (`f32`, `f64`).
///
/// Bundles the numeric and utility traits needed throughout peregrine.
/// Only primitive float types implement this.
pub trait Float:
    NumFloat + FloatConst + FromPrimitive + Copy + Send + Sync + Default + Debug + Display + 'static
{
}

impl Float for f32 {}
impl Float for f64 {}

/// Names of the external math routines the generated code calls for one
/// float width. All of them are registered on the JIT builder and backed
/// by `libm`.
#[derive(Clone, Copy, Debug)]
pub struct MathSymbols {
    pub sin: &'static str,
    pub cos: &'static str,
    pub exp: &'static str,
    pub log: &'static str,
    pub pow: &'static str,
    pub erf: &'static str,
}

/// Float types the code generator can emit native code for.
///
/// Extends [`Float`] with the Cranelift value type and the math-symbol
/// table matching the float width.
pub trait JitFloat: Float {
    /// Cranelift value type for this float.
    const TYPE: Type;
    /// External math routine names for this float width.
    const SYMS: MathSymbols;
}

impl JitFloat for f64 {
    const TYPE: Type = types::F64;
    const SYMS: MathSymbols = MathSymbols {
        sin: "sin",
        cos: "cos",
        exp: "exp",
        log: "log",
        pow: "pow",
        erf: "erf",
    };
}

impl JitFloat for f32 {
    const TYPE: Type = types::F32;
    const SYMS: MathSymbols = MathSymbols {
        sin: "sinf",
        cos: "cosf",
        exp: "expf",
        log: "logf",
        pow: "powf",
        erf: "erff",
    };
}
