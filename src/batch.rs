//! Adaptive Taylor integrator, batch variant.
//!
//! Propagates B copies of the same system side by side: the state is laid
//! out lane-contiguously (`state[i * B + b]` is variable i on lane b), the
//! jet buffer with stride (L, B), and a single jet function evaluates all
//! lanes at one common Taylor order, the maximum over the per-lane
//! selections, so lanes needing a lower order do redundant work. Outcomes,
//! timesteps and the order actually required are tracked per lane; failed
//! lanes keep their pre-step state and time.

use log::debug;

use crate::decompose::{Decomposition, System};
use crate::error::{Error, Outcome};
use crate::expr::param_count;
use crate::float::JitFloat;
use crate::jit::{self, Compiled};
use crate::stepper::{order_for_tol, rho_factor, validate_tolerances};

/// Per-lane result of a batch step: (outcome, timestep, order used).
pub type LaneResult<F> = (Outcome, F, u32);

/// JIT-compiled adaptive Taylor integrator over B independent lanes.
pub struct TaylorAdaptiveBatch<F: JitFloat> {
    sys: System,
    dc: Decomposition,
    batch: usize,
    state: Vec<F>,
    time: Vec<F>,
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
    prev_state: Vec<F>,
    h: Vec<F>,
    res: Vec<LaneResult<F>>,
    compiled: Compiled<F>,
}

impl<F: JitFloat> TaylorAdaptiveBatch<F> {
    /// Build a batch integrator.
    ///
    /// `state` holds `n_eq * batch_size` values, lane-contiguous per
    /// variable; `times` holds one initial time per lane. Tolerances are
    /// shared across lanes. Parameters start out as zeros, one vector slot
    /// per lane (`pars[j * batch_size + b]`).
    pub fn new(
        sys: impl Into<System>,
        state: Vec<F>,
        times: Vec<F>,
        rtol: F,
        atol: F,
        opt_level: u32,
        batch_size: usize,
    ) -> Result<Self, Error> {
        let sys = sys.into();
        if batch_size == 0 {
            return Err(Error::InvalidArgument(
                "the batch size of a batch integrator cannot be zero".to_string(),
            ));
        }
        if state.iter().any(|x| !x.is_finite()) {
            return Err(Error::NonFinite(
                "a non-finite value was detected in the initial state".to_string(),
            ));
        }
        let expected = sys
            .len()
            .checked_mul(batch_size)
            .ok_or_else(|| Error::Overflow("the state size computation overflowed".to_string()))?;
        if state.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "the state vector has a size of {}, but {} equation(s) over {} lane(s) need {}",
                state.len(),
                sys.len(),
                batch_size,
                expected
            )));
        }
        if times.len() != batch_size {
            return Err(Error::InvalidArgument(format!(
                "{} initial time(s) were provided for {} lane(s)",
                times.len(),
                batch_size
            )));
        }
        if times.iter().any(|t| !t.is_finite()) {
            return Err(Error::NonFinite(
                "cannot initialise an integrator with a non-finite initial time".to_string(),
            ));
        }
        validate_tolerances(rtol, atol)?;

        let order_r = order_for_tol(rtol)?;
        let order_a = order_for_tol(atol)?;
        let max_order = order_r.max(order_a);
        debug!(
            "taylor orders: relative {}, absolute {}, batch {}",
            order_r, order_a, batch_size
        );

        let dc = Decomposition::new(sys.clone())?;
        let n_pars = dc.entries().iter().map(param_count).max().unwrap_or(0);

        let compiled = jit::compile::<F>(&dc, order_r, order_a, batch_size, opt_level)?;

        let len = dc.len();
        let jet_size = (max_order as usize + 1)
            .checked_mul(len)
            .and_then(|x| x.checked_mul(batch_size))
            .ok_or_else(|| {
                Error::Overflow(
                    "the computation of the size of the jet of derivatives overflowed".to_string(),
                )
            })?;

        let mut inv_order = vec![F::zero(); max_order as usize + 1];
        for (o, inv) in inv_order.iter_mut().enumerate().skip(1) {
            *inv = F::one() / F::from(o).unwrap();
        }

        let n_state = state.len();
        let mut integrator = TaylorAdaptiveBatch {
            sys,
            dc,
            batch: batch_size,
            state,
            time: times,
            pars: vec![F::zero(); n_pars * batch_size],
            rtol,
            atol,
            opt_level,
            order_r,
            order_a,
            rhofac_r: rho_factor(order_r),
            rhofac_a: rho_factor(order_a),
            inv_order,
            jet: vec![F::zero(); jet_size],
            prev_state: vec![F::zero(); n_state],
            h: vec![F::zero(); batch_size],
            res: vec![(Outcome::Success, F::zero(), 0); batch_size],
            compiled,
        };

        integrator.fill_jet_max_order();
        if integrator.jet.iter().any(|x| !x.is_finite()) {
            return Err(Error::NonFiniteDerivative);
        }

        Ok(integrator)
    }

    fn fill_jet_max_order(&mut self) {
        let n = self.dc.n_eq();
        let row = n * self.batch;
        self.jet[..row].copy_from_slice(&self.state[..row]);
        let jet_fn = if self.order_r > self.order_a {
            self.compiled.jet_r
        } else {
            self.compiled.jet_a
        };
        unsafe {
            jet_fn(
                self.jet.as_mut_ptr(),
                self.pars.as_ptr(),
                self.time.as_ptr(),
            )
        };
    }

    /// One step per lane with automatically deduced timesteps, forward.
    pub fn step(&mut self) -> &[LaneResult<F>] {
        self.step_impl(None, true)
    }

    /// One step per lane with automatically deduced timesteps, backward.
    pub fn step_backward(&mut self) -> &[LaneResult<F>] {
        self.step_impl(None, false)
    }

    /// One step per lane with per-lane timestep limits; the sign of each
    /// limit selects that lane's direction. NaN limits are rejected.
    pub fn step_limited(&mut self, max_dts: &[F]) -> Result<&[LaneResult<F>], Error> {
        if max_dts.len() != self.batch {
            return Err(Error::InvalidArgument(format!(
                "{} timestep limit(s) were provided for {} lane(s)",
                max_dts.len(),
                self.batch
            )));
        }
        if max_dts.iter().any(|x| x.is_nan()) {
            return Err(Error::InvalidArgument(
                "a NaN max_dt was passed to step_limited()".to_string(),
            ));
        }
        Ok(self.step_impl(Some(max_dts.to_vec()), true))
    }

    fn step_impl(&mut self, max_dts: Option<Vec<F>>, forward: bool) -> &[LaneResult<F>] {
        let n = self.dc.n_eq();
        let len = self.dc.len();
        let batch = self.batch;

        // Per-lane mode selection and pre-step finiteness check.
        let mut failed = vec![false; batch];
        let mut max_abs_state = vec![F::zero(); batch];
        let mut orders = vec![0_u32; batch];
        let mut use_abs = vec![false; batch];
        for b in 0..batch {
            let mut m = F::zero();
            let mut finite = true;
            for i in 0..n {
                let x = self.state[i * batch + b];
                if !x.is_finite() {
                    finite = false;
                    break;
                }
                m = m.max(x.abs());
            }
            if !finite {
                failed[b] = true;
                self.res[b] = (Outcome::NonFiniteState, F::zero(), 0);
                continue;
            }
            max_abs_state[b] = m;
            use_abs[b] = self.rtol * m <= self.atol;
            orders[b] = if use_abs[b] { self.order_a } else { self.order_r };
        }

        if failed.iter().all(|&f| f) {
            return &self.res;
        }

        // One jet evaluation at the largest per-lane order; lanes needing
        // less do redundant work but record the order they required.
        let common_order = orders
            .iter()
            .zip(&failed)
            .filter(|(_, &f)| !f)
            .map(|(&o, _)| o)
            .max()
            .unwrap_or(self.order_r);
        let (jet_fn, upd_fn) = if common_order == self.order_a {
            (self.compiled.jet_a, self.compiled.upd_a)
        } else {
            (self.compiled.jet_r, self.compiled.upd_r)
        };

        let row = n * batch;
        self.jet[..row].copy_from_slice(&self.state[..row]);
        unsafe {
            jet_fn(
                self.jet.as_mut_ptr(),
                self.pars.as_ptr(),
                self.time.as_ptr(),
            )
        };

        // Per-lane derivative check, rho estimation, timestep deduction.
        for b in 0..batch {
            if failed[b] {
                self.h[b] = F::zero();
                continue;
            }
            let order = orders[b] as usize;

            let mut finite = true;
            'outer: for o in 1..=order {
                for i in 0..n {
                    if !self.jet[(o * len + i) * batch + b].is_finite() {
                        finite = false;
                        break 'outer;
                    }
                }
            }
            if !finite {
                failed[b] = true;
                self.h[b] = F::zero();
                self.res[b] = (Outcome::NonFiniteDerivative, F::zero(), 0);
                continue;
            }

            let mut max_abs_diff_o = F::zero();
            let mut max_abs_diff_om1 = F::zero();
            for i in 0..n {
                max_abs_diff_om1 =
                    max_abs_diff_om1.max(self.jet[((order - 1) * len + i) * batch + b].abs());
                max_abs_diff_o = max_abs_diff_o.max(self.jet[(order * len + i) * batch + b].abs());
            }
            let numer = if use_abs[b] {
                F::one()
            } else {
                max_abs_state[b]
            };
            let rho_om1 = (numer / max_abs_diff_om1).powf(self.inv_order[order - 1]);
            let rho_o = (numer / max_abs_diff_o).powf(self.inv_order[order]);
            if rho_om1.is_nan() || rho_o.is_nan() {
                failed[b] = true;
                self.h[b] = F::zero();
                self.res[b] = (Outcome::RhoNaN, F::zero(), 0);
                continue;
            }

            let rhofac = if use_abs[b] {
                self.rhofac_a
            } else {
                self.rhofac_r
            };
            let mut outcome = Outcome::Success;
            let mut h = rho_o.min(rho_om1) * rhofac;
            let mut lane_forward = forward;
            if let Some(limits) = &max_dts {
                let max_dt = limits[b];
                lane_forward = max_dt >= F::zero();
                let magnitude = max_dt.abs();
                if magnitude.is_finite() && h > magnitude {
                    h = magnitude;
                    outcome = Outcome::TimeLimit;
                }
            }
            if !lane_forward {
                h = -h;
            }
            self.h[b] = h;
            self.res[b] = (outcome, h, orders[b]);
        }

        // A single update over all lanes; failed lanes get h = 0 but their
        // coefficients may be junk, so their state is restored afterwards.
        self.prev_state.copy_from_slice(&self.state);
        unsafe {
            upd_fn(
                self.state.as_mut_ptr(),
                self.jet.as_ptr(),
                self.h.as_ptr(),
            )
        };
        for b in 0..batch {
            if failed[b] {
                for i in 0..n {
                    self.state[i * batch + b] = self.prev_state[i * batch + b];
                }
            } else {
                self.time[b] = self.time[b] + self.h[b];
            }
        }

        &self.res
    }

    /// Number of lanes.
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Lane-contiguous state vector (`state[i * B + b]`).
    pub fn state(&self) -> &[F] {
        &self.state
    }

    /// Per-lane times.
    pub fn times(&self) -> &[F] {
        &self.time
    }

    /// Per-lane parameter values (`pars[j * B + b]`).
    pub fn pars(&self) -> &[F] {
        &self.pars
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

    /// Overwrite the per-lane times.
    pub fn set_times(&mut self, times: &[F]) -> Result<(), Error> {
        if times.len() != self.batch {
            return Err(Error::InvalidArgument(format!(
                "{} time(s) were passed to set_times() for {} lane(s)",
                times.len(),
                self.batch
            )));
        }
        if times.iter().any(|t| !t.is_finite()) {
            return Err(Error::NonFinite(
                "a non-finite time was passed to set_times()".to_string(),
            ));
        }
        self.time.copy_from_slice(times);
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

    /// Overwrite the per-lane parameter values.
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

impl<F: JitFloat> Clone for TaylorAdaptiveBatch<F> {
    /// Deep copy: the source expressions are re-decomposed and re-compiled
    /// so the two integrators never share function pointers or code
    /// memory.
    fn clone(&self) -> Self {
        let mut other = Self::new(
            self.sys.clone(),
            self.state.clone(),
            self.time.clone(),
            self.rtol,
            self.atol,
            self.opt_level,
            self.batch,
        )
        .expect("recompiling an already-validated system");
        other.pars.copy_from_slice(&self.pars);
        other
    }
}
