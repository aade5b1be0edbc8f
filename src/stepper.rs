//! Adaptive Taylor integrator, scalar variant.
//!
//! Owns the compiled jet/update functions, the state vector, the time and
//! the jet buffer, and drives them in the step loop: per-step the Taylor
//! order is picked from the tolerance mode, the radius of convergence is
//! estimated from the two highest-order coefficient rows, and the timestep
//! follows with the safety factor applied.

use log::debug;

use crate::decompose::{Decomposition, System};
use crate::error::{Error, Outcome};
use crate::expr::param_count;
use crate::float::{Float, JitFloat};
use crate::jit::{self, Compiled};

/// Aggregate statistics of a propagation run.
///
/// `min_h`/`max_h` cover the full, unclamped steps only; they start out as
/// (inf, 0), and `min_order`/`max_order` as (u32::MAX, 0), so a run that
/// ends before its first full step reports the initial values.
#[derive(Clone, Copy, Debug)]
pub struct PropagateStats<F: Float> {
    /// Number of steps completed.
    pub steps: usize,
    /// Smallest |h| over the non-clamped steps.
    pub min_h: F,
    /// Largest |h| over the non-clamped steps.
    pub max_h: F,
    /// Smallest Taylor order used.
    pub min_order: u32,
    /// Largest Taylor order used.
    pub max_order: u32,
}

impl<F: Float> PropagateStats<F> {
    fn new() -> Self {
        PropagateStats {
            steps: 0,
            min_h: F::infinity(),
            max_h: F::zero(),
            min_order: u32::MAX,
            max_order: 0,
        }
    }
}

/// Taylor order from a tolerance: `max(2, ceil(-ln(tol)/2 + 1))`.
pub(crate) fn order_for_tol<F: Float>(tol: F) -> Result<u32, Error> {
    let two = F::from(2).unwrap();
    let order = (-tol.ln() / two + F::one()).ceil().max(two);
    if !order.is_finite() {
        return Err(Error::NonFinite(
            "the computation of the Taylor order produced a non-finite value".to_string(),
        ));
    }
    order.to_u32().ok_or_else(|| {
        Error::Overflow("the computation of the Taylor order overflowed".to_string())
    })
}

/// Safety factor applied to the radius-of-convergence estimate:
/// `e^-2 * exp(-0.7 / (order - 1))`.
pub(crate) fn rho_factor<F: Float>(order: u32) -> F {
    let e = F::E();
    (F::one() / (e * e)) * (F::from(-0.7).unwrap() / F::from(order - 1).unwrap()).exp()
}

pub(crate) fn validate_tolerances<F: Float>(rtol: F, atol: F) -> Result<(), Error> {
    if !rtol.is_finite() || rtol <= F::zero() {
        return Err(Error::InvalidArgument(format!(
            "the relative tolerance must be finite and positive, but it is {} instead",
            rtol
        )));
    }
    if !atol.is_finite() || atol <= F::zero() {
        return Err(Error::InvalidArgument(format!(
            "the absolute tolerance must be finite and positive, but it is {} instead",
            atol
        )));
    }
    Ok(())
}

/// JIT-compiled adaptive Taylor integrator over one state vector.
pub struct TaylorAdaptive<F: JitFloat> {
    sys: System,
    dc: Decomposition,
    state: Vec<F>,
    time: F,
    pars: Vec<F>,
    rtol: F,
    atol: F,
    opt_level: u32,
    order_r: u32,
    order_a: u32,
    rhofac_r: F,
    rhofac_a: F,
    inv_order: Vec<F>,
    jet: Vec<F>,
    compiled: Compiled<F>,
}

impl<F: JitFloat> TaylorAdaptive<F> {
    /// Build an integrator from a system (right-hand sides or explicit
    /// `(lhs, rhs)` pairs), an initial state, the initial time, the two
    /// tolerances and the JIT optimisation level.
    ///
    /// Validation, decomposition and compilation failures propagate;
    /// construction also evaluates the jet once at the initial state and
    /// rejects systems producing non-finite derivatives there. Parameters
    /// start out as zeros; see [`set_pars`](Self::set_pars).
    pub fn new(
        sys: impl Into<System>,
        state: Vec<F>,
        time: F,
        rtol: F,
        atol: F,
        opt_level: u32,
    ) -> Result<Self, Error> {
        Self::new_impl(sys.into(), state, time, rtol, atol, opt_level, None)
    }

    /// Like [`new`](Self::new), with an initial parameter vector.
    pub fn with_pars(
        sys: impl Into<System>,
        state: Vec<F>,
        time: F,
        rtol: F,
        atol: F,
        opt_level: u32,
        pars: Vec<F>,
    ) -> Result<Self, Error> {
        Self::new_impl(sys.into(), state, time, rtol, atol, opt_level, Some(pars))
    }

    fn new_impl(
        sys: System,
        state: Vec<F>,
        time: F,
        rtol: F,
        atol: F,
        opt_level: u32,
        pars: Option<Vec<F>>,
    ) -> Result<Self, Error> {
        if state.iter().any(|x| !x.is_finite()) {
            return Err(Error::NonFinite(
                "a non-finite value was detected in the initial state".to_string(),
            ));
        }
        if state.len() != sys.len() {
            return Err(Error::InvalidArgument(format!(
                "the state vector has a size of {}, while the number of equations is {}",
                state.len(),
                sys.len()
            )));
        }
        if !time.is_finite() {
            return Err(Error::NonFinite(
                "cannot initialise an integrator with a non-finite initial time".to_string(),
            ));
        }
        validate_tolerances(rtol, atol)?;

        let order_r = order_for_tol(rtol)?;
        let order_a = order_for_tol(atol)?;
        let max_order = order_r.max(order_a);
        debug!(
            "taylor orders: relative {}, absolute {}",
            order_r, order_a
        );

        let dc = Decomposition::new(sys.clone())?;
        let n_pars = dc.entries().iter().map(param_count).max().unwrap_or(0);
        let pars = match pars {
            Some(p) => {
                if p.len() != n_pars {
                    return Err(Error::InvalidArgument(format!(
                        "{} parameter value(s) were provided, but the system references {}",
                        p.len(),
                        n_pars
                    )));
                }
                p
            }
            None => vec![F::zero(); n_pars],
        };

        let compiled = jit::compile::<F>(&dc, order_r, order_a, 1, opt_level)?;

        let len = dc.len();
        let jet_size = (max_order as usize + 1)
            .checked_mul(len)
            .ok_or_else(|| {
                Error::Overflow(
                    "the computation of the size of the jet of derivatives overflowed".to_string(),
                )
            })?;

        let mut inv_order = vec![F::zero(); max_order as usize + 1];
        for (o, inv) in inv_order.iter_mut().enumerate().skip(1) {
            *inv = F::one() / F::from(o).unwrap();
        }

        let mut integrator = TaylorAdaptive {
            sys,
            dc,
            state,
            time,
            pars,
            rtol,
            atol,
            opt_level,
            order_r,
            order_a,
            rhofac_r: rho_factor(order_r),
            rhofac_a: rho_factor(order_a),
            inv_order,
            jet: vec![F::zero(); jet_size],
            compiled,
        };

        // Reject systems whose derivatives are already non-finite at the
        // initial state.
        integrator.fill_jet_max_order();
        if integrator.jet.iter().any(|x| !x.is_finite()) {
            return Err(Error::NonFiniteDerivative);
        }

        Ok(integrator)
    }

    fn fill_jet_max_order(&mut self) {
        let n = self.dc.n_eq();
        self.jet[..n].copy_from_slice(&self.state);
        let jet_fn = if self.order_r > self.order_a {
            self.compiled.jet_r
        } else {
            self.compiled.jet_a
        };
        unsafe { jet_fn(self.jet.as_mut_ptr(), self.pars.as_ptr(), &self.time) };
    }

    /// Evaluate the jet of normalised Taylor coefficients at the current
    /// state and time, at the larger of the two orders.
    ///
    /// The returned buffer is order-major: entry `o * len + i` is the
    /// order-`o` coefficient of u-variable `i`.
    pub fn eval_jet(&mut self) -> &[F] {
        self.fill_jet_max_order();
        &self.jet
    }

    /// One step with an automatically deduced timestep, forward in time.
    pub fn step(&mut self) -> (Outcome, F, u32) {
        self.step_impl(None, true)
    }

    /// One step with an automatically deduced timestep, backward in time.
    pub fn step_backward(&mut self) -> (Outcome, F, u32) {
        self.step_impl(None, false)
    }

    /// One step whose timestep magnitude is clamped to `|max_dt|`, in the
    /// direction of `max_dt`'s sign.
    ///
    /// `max_dt` may be ±∞ for "no limit"; NaN is a contract violation.
    pub fn step_limited(&mut self, max_dt: F) -> Result<(Outcome, F, u32), Error> {
        if max_dt.is_nan() {
            return Err(Error::InvalidArgument(
                "a NaN max_dt was passed to step_limited()".to_string(),
            ));
        }
        let (magnitude, forward) = if max_dt >= F::zero() {
            (max_dt, true)
        } else {
            (-max_dt, false)
        };
        let limit = if magnitude.is_infinite() {
            None
        } else {
            Some(magnitude)
        };
        Ok(self.step_impl(limit, forward))
    }

    /// The step kernel. `limit` is the nonnegative timestep magnitude cap,
    /// if any; the returned timestep carries the direction sign.
    fn step_impl(&mut self, limit: Option<F>, forward: bool) -> (Outcome, F, u32) {
        let n = self.dc.n_eq();
        let len = self.dc.len();

        let mut max_abs_state = F::zero();
        for &x in &self.state {
            if !x.is_finite() {
                return (Outcome::NonFiniteState, F::zero(), 0);
            }
            max_abs_state = max_abs_state.max(x.abs());
        }

        // Tolerance mode for this step.
        let use_abs_tol = self.rtol * max_abs_state <= self.atol;
        let (order, rhofac, jet_fn, upd_fn) = if use_abs_tol {
            (
                self.order_a,
                self.rhofac_a,
                self.compiled.jet_a,
                self.compiled.upd_a,
            )
        } else {
            (
                self.order_r,
                self.rhofac_r,
                self.compiled.jet_r,
                self.compiled.upd_r,
            )
        };
        let order_idx = order as usize;

        self.jet[..n].copy_from_slice(&self.state);
        unsafe { jet_fn(self.jet.as_mut_ptr(), self.pars.as_ptr(), &self.time) };

        for o in 1..=order_idx {
            for i in 0..n {
                if !self.jet[o * len + i].is_finite() {
                    return (Outcome::NonFiniteDerivative, F::zero(), 0);
                }
            }
        }

        // Radius-of-convergence estimates at the two highest orders.
        let mut max_abs_diff_o = F::zero();
        let mut max_abs_diff_om1 = F::zero();
        for i in 0..n {
            max_abs_diff_om1 = max_abs_diff_om1.max(self.jet[(order_idx - 1) * len + i].abs());
            max_abs_diff_o = max_abs_diff_o.max(self.jet[order_idx * len + i].abs());
        }
        let numer = if use_abs_tol { F::one() } else { max_abs_state };
        let rho_om1 = (numer / max_abs_diff_om1).powf(self.inv_order[order_idx - 1]);
        let rho_o = (numer / max_abs_diff_o).powf(self.inv_order[order_idx]);
        if rho_om1.is_nan() || rho_o.is_nan() {
            return (Outcome::RhoNaN, F::zero(), 0);
        }

        let mut outcome = Outcome::Success;
        let mut h = rho_o.min(rho_om1) * rhofac;
        if let Some(limit) = limit {
            if h > limit {
                h = limit;
                outcome = Outcome::TimeLimit;
            }
        }
        if !forward {
            h = -h;
        }

        unsafe { upd_fn(self.state.as_mut_ptr(), self.jet.as_ptr(), &h) };
        self.time = self.time + h;

        (outcome, h, order)
    }

    /// Propagate over a time interval of `dt`.
    pub fn propagate_for(
        &mut self,
        dt: F,
        max_steps: usize,
    ) -> Result<(Outcome, PropagateStats<F>), Error> {
        self.propagate_until(self.time + dt, max_steps)
    }

    /// Propagate until the time reaches `t` exactly, or until a failure
    /// outcome, or until `max_steps` steps (0 = unbounded).
    ///
    /// When the final step is clamped by the remaining interval, the time
    /// is set to `t` exactly rather than left to the round-off of the
    /// accumulated sum.
    pub fn propagate_until(
        &mut self,
        t: F,
        max_steps: usize,
    ) -> Result<(Outcome, PropagateStats<F>), Error> {
        if !t.is_finite() {
            return Err(Error::InvalidArgument(
                "a non-finite time was passed to propagate_until()".to_string(),
            ));
        }

        let mut stats = PropagateStats::new();
        if t == self.time {
            return Ok((Outcome::TimeLimit, stats));
        }

        let forward = t > self.time;
        let initial_gap = if forward { t - self.time } else { self.time - t };
        if !initial_gap.is_finite() {
            return Err(Error::Overflow(
                "the time limit passed to propagate_until() results in an overflow".to_string(),
            ));
        }

        loop {
            let remaining = if forward { t - self.time } else { self.time - t };
            let (res, h, order) = self.step_impl(Some(remaining), forward);
            if !res.keeps_going() {
                return Ok((res, stats));
            }

            stats.steps += 1;
            stats.min_order = stats.min_order.min(order);
            stats.max_order = stats.max_order.max(order);

            if res == Outcome::TimeLimit {
                // The clamp fired: this was the final step, land exactly.
                self.time = t;
                return Ok((Outcome::TimeLimit, stats));
            }

            stats.min_h = stats.min_h.min(h.abs());
            stats.max_h = stats.max_h.max(h.abs());

            if max_steps != 0 && stats.steps == max_steps {
                return Ok((Outcome::StepLimit, stats));
            }
        }
    }

    /// Current state vector.
    pub fn state(&self) -> &[F] {
        &self.state
    }

    /// Current time.
    pub fn time(&self) -> F {
        self.time
    }

    /// Parameter values.
    pub fn pars(&self) -> &[F] {
        &self.pars
    }

    /// The (relative, absolute) tolerances.
    pub fn tolerances(&self) -> (F, F) {
        (self.rtol, self.atol)
    }

    /// The (relative, absolute) Taylor orders.
    pub fn orders(&self) -> (u32, u32) {
        (self.order_r, self.order_a)
    }

    /// Textual IR of the emitted functions, for inspection.
    pub fn ir(&self) -> &str {
        self.compiled.module.clif()
    }

    /// The Taylor decomposition backing the compiled functions.
    pub fn decomposition(&self) -> &Decomposition {
        &self.dc
    }

    /// Overwrite the time.
    pub fn set_time(&mut self, t: F) -> Result<(), Error> {
        if !t.is_finite() {
            return Err(Error::NonFinite(format!(
                "non-finite time {} passed to set_time()",
                t
            )));
        }
        self.time = t;
        Ok(())
    }

    /// Overwrite the state vector.
    pub fn set_state(&mut self, state: &[F]) -> Result<(), Error> {
        if state.len() != self.state.len() {
            return Err(Error::InvalidArgument(format!(
                "the state vector passed to set_state() has a size of {}, expected {}",
                state.len(),
                self.state.len()
            )));
        }
        if state.iter().any(|x| !x.is_finite()) {
            return Err(Error::NonFinite(
                "a non-finite state vector was passed to set_state()".to_string(),
            ));
        }
        self.state.copy_from_slice(state);
        Ok(())
    }

    /// Overwrite the parameter values.
    pub fn set_pars(&mut self, pars: &[F]) -> Result<(), Error> {
        if pars.len() != self.pars.len() {
            return Err(Error::InvalidArgument(format!(
                "{} parameter value(s) were passed to set_pars(), expected {}",
                pars.len(),
                self.pars.len()
            )));
        }
        self.pars.copy_from_slice(pars);
        Ok(())
    }
}

impl<F: JitFloat> Clone for TaylorAdaptive<F> {
    /// Deep copy: the source expressions are re-decomposed and re-compiled
    /// so the two integrators never share function pointers or code
    /// memory.
    fn clone(&self) -> Self {
        Self::new_impl(
            self.sys.clone(),
            self.state.clone(),
            self.time,
            self.rtol,
            self.atol,
            self.opt_level,
            Some(self.pars.clone()),
        )
        .expect("recompiling an already-validated system")
    }
}
