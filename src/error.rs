//! Error and outcome types.
//!
//! Construction-time and contract failures are reported through [`Error`];
//! per-step conditions travel as [`Outcome`] values next to the timestep
//! and Taylor order actually used, so partial progress stays observable.

use thiserror::Error;

/// Construction and contract-violation errors.
///
/// Nothing is mutated when one of these is returned.
#[derive(Debug, Error)]
pub enum Error {
    /// A system of zero equations was passed to the decomposition.
    #[error("cannot decompose a system of zero equations")]
    EmptySystem,

    /// The number of variables deduced from the right-hand sides differs
    /// from the number of equations.
    #[error("deduced {n_vars} variable(s) for a system of {n_eq} equation(s)")]
    AritySystemMismatch { n_vars: usize, n_eq: usize },

    /// A left-hand side of an explicit system is not a variable.
    #[error("the left-hand side expression '{0}' is not a variable")]
    NonVariableLhs(String),

    /// A variable appears twice on the left-hand side of an explicit system.
    #[error("the variable '{0}' appears in the left-hand side twice")]
    DuplicateLhs(String),

    /// A right-hand side references a variable that is not a state variable.
    #[error("the variable '{0}' appears in the right-hand side but not in the left-hand side")]
    UnknownRhsVariable(String),

    /// A variable is missing from an evaluation mapping.
    #[error("the variable '{0}' is not bound in the evaluation map")]
    UnboundVariable(String),

    /// A parameter index exceeds the supplied parameter vector.
    #[error("parameter index {index} is out of range for {len} parameter(s)")]
    ParamOutOfRange { index: usize, len: usize },

    /// The Taylor recurrence for `pow` needs a constant exponent.
    #[error("the exponent of '{0}' is not a constant: no Taylor recurrence is available")]
    UnsupportedExponent(String),

    /// A non-finite value was found where a finite one is required.
    #[error("{0}")]
    NonFinite(String),

    /// Non-finite derivatives were produced for the initial state.
    #[error("non-finite value(s) in the jet of derivatives for the initial state")]
    NonFiniteDerivative,

    /// A size or index computation overflowed.
    #[error("{0}")]
    Overflow(String),

    /// An argument violates the documented contract (e.g. a NaN timestep).
    #[error("{0}")]
    InvalidArgument(String),

    /// The JIT backend rejected the module.
    #[error("code generation failed: {0}")]
    Codegen(String),
}

/// Outcome of a single integration timestep (or of a propagation run).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Outcome {
    /// The step completed with the full, automatically deduced timestep.
    Success,
    /// The timestep was clamped by the time limit.
    TimeLimit,
    /// The maximum number of steps was reached while propagating.
    StepLimit,
    /// A non-finite value was detected in the state vector before stepping.
    NonFiniteState,
    /// A non-finite Taylor coefficient was produced by the jet evaluation.
    NonFiniteDerivative,
    /// The radius-of-convergence estimate came out as NaN.
    RhoNaN,
}

impl Outcome {
    /// True for the two outcomes that leave the integrator in a usable state.
    #[inline]
    pub fn keeps_going(self) -> bool {
        matches!(self, Outcome::Success | Outcome::TimeLimit)
    }
}
