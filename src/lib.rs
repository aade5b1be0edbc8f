//! JIT-compiled adaptive Taylor-series integration of ODE systems.
//!
//! A system of ODEs is written symbolically with the [`expr`] builders,
//! lowered into a list of elementary operations ([`decompose`]), compiled
//! to native jet/update functions via Cranelift, and driven by an adaptive
//! stepper that picks the Taylor order and the timestep from the requested
//! tolerances.
//!
//! ```no_run
//! use peregrine::{sin, var, TaylorAdaptive};
//!
//! // Pendulum: x' = v, v' = -sin(x).
//! let sys = vec![(var("x"), var("v")), (var("v"), -sin(var("x")))];
//! let mut ta = TaylorAdaptive::new(sys, vec![0.5, 0.0], 0.0, 1e-12, 1e-12, 2)?;
//! ta.propagate_until(10.0, 0)?;
//! println!("x(10) = {}", ta.state()[0]);
//! # Ok::<(), peregrine::Error>(())
//! ```

pub mod batch;
pub mod decompose;
pub mod error;
pub mod expr;
pub mod float;
mod jit;
pub mod simd;
pub mod stepper;

pub use batch::{LaneResult, TaylorAdaptiveBatch};
pub use decompose::{Decomposition, System};
pub use error::{Error, Outcome};
pub use expr::func::{cos, erf, exp, log, pow, sin, sqrt};
pub use expr::{
    diff, eval, eval_batch, get_variables, num, par, rename_variables, subs, time, var, BinOp,
    Expr, Func,
};
pub use float::{Float, JitFloat};
pub use simd::{recommended_batch_size, vector_width_for};
pub use stepper::{PropagateStats, TaylorAdaptive};

/// Type alias for a double-precision scalar integrator.
pub type TaylorAdaptive64 = TaylorAdaptive<f64>;
/// Type alias for a single-precision scalar integrator.
pub type TaylorAdaptive32 = TaylorAdaptive<f32>;
/// Type alias for a double-precision batch integrator.
pub type TaylorAdaptiveBatch64 = TaylorAdaptiveBatch<f64>;
/// Type alias for a single-precision batch integrator.
pub type TaylorAdaptiveBatch32 = TaylorAdaptiveBatch<f32>;
