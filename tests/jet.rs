//! Checks of the emitted jet functions against closed-form Taylor series.

use approx::assert_relative_eq;
use peregrine::{erf, num, pow, sin, time, var, Error, TaylorAdaptive};

#[test]
fn linear_ode_jet_is_inverse_factorials() {
    // x' = x, x(0) = 1: c[o] = 1/o!.
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), var("x"))],
        vec![1.0_f64],
        0.0,
        1e-15,
        1e-15,
        2,
    )
    .unwrap();
    let (order, _) = ta.orders();
    let len = ta.decomposition().len();
    let jet = ta.eval_jet();
    let mut factorial = 1.0_f64;
    for o in 0..=order as usize {
        if o > 0 {
            factorial *= o as f64;
        }
        assert_relative_eq!(jet[o * len], 1.0 / factorial, epsilon = 1e-14, max_relative = 1e-13);
    }
}

#[test]
fn harmonic_oscillator_jet_is_sine_series() {
    // x' = y, y' = -x with (0, 1): x(t) = sin(t), y(t) = cos(t).
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), var("y")), (var("y"), -var("x"))],
        vec![0.0_f64, 1.0],
        0.0,
        1e-15,
        1e-15,
        2,
    )
    .unwrap();
    let (order, _) = ta.orders();
    let len = ta.decomposition().len();
    let jet = ta.eval_jet();
    let mut factorial = 1.0_f64;
    for o in 0..=order as usize {
        if o > 0 {
            factorial *= o as f64;
        }
        // sin series: 0, 1, 0, -1/6, ...; cos series: 1, 0, -1/2, ...
        let expected_x = match o % 4 {
            1 => 1.0 / factorial,
            3 => -1.0 / factorial,
            _ => 0.0,
        };
        let expected_y = match o % 4 {
            0 => 1.0 / factorial,
            2 => -1.0 / factorial,
            _ => 0.0,
        };
        assert_relative_eq!(jet[o * len], expected_x, epsilon = 1e-15, max_relative = 1e-13);
        assert_relative_eq!(jet[o * len + 1], expected_y, epsilon = 1e-15, max_relative = 1e-13);
    }
}

#[test]
fn time_dependent_jet() {
    // x' = t at t0 = 2: c[1] = 2, c[2] = 1/2, higher orders vanish.
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), time())],
        vec![7.0_f64],
        2.0,
        1e-12,
        1e-12,
        2,
    )
    .unwrap();
    let (order, _) = ta.orders();
    let len = ta.decomposition().len();
    let jet = ta.eval_jet();
    assert_relative_eq!(jet[0], 7.0, epsilon = 1e-15);
    assert_relative_eq!(jet[len], 2.0, epsilon = 1e-15);
    assert_relative_eq!(jet[2 * len], 0.5, epsilon = 1e-15);
    for o in 3..=order as usize {
        assert_eq!(jet[o * len], 0.0);
    }
}

#[test]
fn sin_jet_matches_chain_rule() {
    // x' = sin(x) at x0: c[1] = sin(x0), c[2] = sin(x0)cos(x0)/2.
    let x0 = 0.7_f64;
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), sin(var("x")))],
        vec![x0],
        0.0,
        1e-12,
        1e-12,
        2,
    )
    .unwrap();
    let len = ta.decomposition().len();
    let jet = ta.eval_jet();
    assert_relative_eq!(jet[len], x0.sin(), epsilon = 1e-15);
    assert_relative_eq!(jet[2 * len], x0.sin() * x0.cos() / 2.0, epsilon = 1e-15);
}

#[test]
fn pow_jet_matches_chain_rule() {
    // x' = x^1.5 at x0: c[1] = x0^1.5, c[2] = 1.5 * x0^0.5 * c[1] / 2.
    let x0 = 2.0_f64;
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), pow(var("x"), 1.5))],
        vec![x0],
        0.0,
        1e-12,
        1e-12,
        2,
    )
    .unwrap();
    let len = ta.decomposition().len();
    let jet = ta.eval_jet();
    let c1 = x0.powf(1.5);
    assert_relative_eq!(jet[len], c1, epsilon = 1e-14);
    assert_relative_eq!(jet[2 * len], 1.5 * x0.powf(0.5) * c1 / 2.0, max_relative = 1e-13);
}

#[test]
fn erf_jet_matches_chain_rule() {
    // x' = erf(x) at x0: c[1] = erf(x0),
    // c[2] = erf'(x0) * erf(x0) / 2 with erf'(x) = (2/sqrt(pi)) exp(-x²).
    let x0 = 0.3_f64;
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), erf(var("x")))],
        vec![x0],
        0.0,
        1e-12,
        1e-12,
        2,
    )
    .unwrap();
    let len = ta.decomposition().len();
    let jet = ta.eval_jet();
    let e1 = libm::erf(x0);
    let d = std::f64::consts::FRAC_2_SQRT_PI * (-x0 * x0).exp();
    assert_relative_eq!(jet[len], e1, epsilon = 1e-15);
    assert_relative_eq!(jet[2 * len], d * e1 / 2.0, max_relative = 1e-13);
}

#[test]
fn non_constant_exponent_is_rejected() {
    let res = TaylorAdaptive::new(
        vec![(var("x"), pow(var("x"), var("x")))],
        vec![1.0_f64],
        0.0,
        1e-12,
        1e-12,
        2,
    );
    assert!(matches!(res, Err(Error::UnsupportedExponent(_))));
}

#[test]
fn emitted_ir_is_inspectable() {
    let ta = TaylorAdaptive::new(
        vec![(var("x"), num(1.0) - var("x"))],
        vec![0.0_f64],
        0.0,
        1e-9,
        1e-9,
        0,
    )
    .unwrap();
    let ir = ta.ir();
    assert!(ir.contains("jet_r"));
    assert!(ir.contains("upd_r"));
}
