//! Adaptive stepper behavior: order selection, conservation, round-trips,
//! outcomes and input validation.

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use peregrine::{
    cos, log, num, par, sin, time, var, Error, Expr, Outcome, TaylorAdaptive, TaylorAdaptive32,
};

fn harmonic(tol: f64) -> TaylorAdaptive<f64> {
    TaylorAdaptive::new(
        vec![(var("x"), var("y")), (var("y"), -var("x"))],
        vec![0.0, 1.0],
        0.0,
        tol,
        tol,
        2,
    )
    .unwrap()
}

#[test]
fn order_selection_follows_the_tolerance() {
    for k in [3_i32, 6, 9, 12, 15] {
        let tol = 10.0_f64.powi(-k);
        let ta = TaylorAdaptive::new(
            vec![(var("x"), var("x"))],
            vec![1.0_f64],
            0.0,
            tol,
            tol,
            0,
        )
        .unwrap();
        let expected = (f64::from(k) * 10.0_f64.ln() / 2.0 + 1.0).ceil().max(2.0) as u32;
        assert_eq!(ta.orders(), (expected, expected));
    }
}

#[test]
fn harmonic_energy_is_conserved() {
    let mut ta = harmonic(1e-15);
    let (oc, stats) = ta.propagate_until(10.0, 0).unwrap();
    assert_eq!(oc, Outcome::TimeLimit);
    assert!(stats.steps > 0);
    assert_eq!(ta.time(), 10.0);
    let [x, y] = [ta.state()[0], ta.state()[1]];
    assert!((x * x + y * y - 1.0).abs() <= 1e-12);
    assert_relative_eq!(x, 10.0_f64.sin(), max_relative = 1e-11);
    assert_relative_eq!(y, 10.0_f64.cos(), max_relative = 1e-11);
}

#[test]
fn random_trig_system_round_trips() {
    // Ten equations of sin/cos compositions; forward 10 time units and
    // back again must reproduce the initial state.
    let mut rng = StdRng::seed_from_u64(42);
    let names: Vec<String> = (0..10).map(|i| format!("v{}", i)).collect();
    let mut sys: Vec<(Expr, Expr)> = Vec::new();
    for name in &names {
        let a = var(names[rng.gen_range(0..names.len())].clone());
        let b = var(names[rng.gen_range(0..names.len())].clone());
        let rhs = if rng.gen_bool(0.5) {
            sin(a) + cos(b)
        } else {
            sin(a) * cos(b)
        };
        sys.push((var(name.clone()), rhs));
    }
    let x0: Vec<f64> = (0..10).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut ta = TaylorAdaptive::new(sys, x0.clone(), 0.0, 1e-12, 1e-12, 2).unwrap();
    let (oc, _) = ta.propagate_until(10.0, 0).unwrap();
    assert_eq!(oc, Outcome::TimeLimit);
    let (oc, _) = ta.propagate_until(0.0, 0).unwrap();
    assert_eq!(oc, Outcome::TimeLimit);
    assert_eq!(ta.time(), 0.0);

    let err = ta
        .state()
        .iter()
        .zip(&x0)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f64, f64::max);
    assert!(err <= 1e-10, "round-trip error {} too large", err);
}

#[test]
fn limited_steps_clamp_and_sign() {
    let mut ta = harmonic(1e-12);
    let (oc, h, order) = ta.step_limited(1e-3).unwrap();
    assert_eq!(oc, Outcome::TimeLimit);
    assert_eq!(h, 1e-3);
    assert!(order >= 2);
    assert_relative_eq!(ta.time(), 1e-3, epsilon = 1e-18);

    let (oc, h, _) = ta.step_limited(-1e-3).unwrap();
    assert_eq!(oc, Outcome::TimeLimit);
    assert_eq!(h, -1e-3);
    assert_relative_eq!(ta.time(), 0.0, epsilon = 1e-18);

    // Unlimited magnitudes never clamp.
    let (oc, h, _) = ta.step_limited(f64::INFINITY).unwrap();
    assert_eq!(oc, Outcome::Success);
    assert!(h > 1e-3);
    let (oc, h2, _) = ta.step_limited(f64::NEG_INFINITY).unwrap();
    assert_eq!(oc, Outcome::Success);
    assert!(h2 < 0.0);

    assert!(matches!(
        ta.step_limited(f64::NAN),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn backward_steps_move_backward() {
    let mut ta = harmonic(1e-12);
    let (oc, h, _) = ta.step_backward();
    assert_eq!(oc, Outcome::Success);
    assert!(h < 0.0);
    assert!(ta.time() < 0.0);
}

#[test]
fn propagate_respects_step_limit() {
    let mut ta = harmonic(1e-12);
    let (oc, stats) = ta.propagate_until(1000.0, 3).unwrap();
    assert_eq!(oc, Outcome::StepLimit);
    assert_eq!(stats.steps, 3);
    assert!(stats.min_h > 0.0);
    assert!(stats.max_h >= stats.min_h);
    assert!(ta.time() < 1000.0);
}

#[test]
fn propagate_lands_exactly() {
    let mut ta = harmonic(1e-12);
    let target = 0.123456789;
    ta.propagate_until(target, 0).unwrap();
    assert_eq!(ta.time(), target);
    // Propagating to the current time is a no-op time limit.
    let (oc, stats) = ta.propagate_until(target, 0).unwrap();
    assert_eq!(oc, Outcome::TimeLimit);
    assert_eq!(stats.steps, 0);
}

#[test]
fn propagate_for_moves_relative() {
    let mut ta = harmonic(1e-12);
    ta.propagate_for(2.5, 0).unwrap();
    assert_eq!(ta.time(), 2.5);
    ta.propagate_for(-2.5, 0).unwrap();
    assert_eq!(ta.time(), 0.0);
}

#[test]
fn propagate_rejects_bad_targets() {
    let mut ta = harmonic(1e-12);
    assert!(matches!(
        ta.propagate_until(f64::NAN, 0),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        ta.propagate_until(f64::INFINITY, 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn blowup_ends_with_a_failure_outcome() {
    // x' = x² blows up at t = 1/x0; the coefficients overflow before that.
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), var("x") * var("x"))],
        vec![10.0_f64],
        0.0,
        1e-12,
        1e-12,
        2,
    )
    .unwrap();
    let (oc, _) = ta.propagate_until(1.0, 0).unwrap();
    assert!(!oc.keeps_going());
    assert!(ta.time() < 1.0);
}

#[test]
fn construction_validation() {
    let sys = || vec![(var("x"), var("x"))];
    assert!(matches!(
        TaylorAdaptive::new(sys(), vec![f64::NAN], 0.0, 1e-9, 1e-9, 2),
        Err(Error::NonFinite(_))
    ));
    assert!(matches!(
        TaylorAdaptive::new(sys(), vec![1.0, 2.0], 0.0, 1e-9, 1e-9, 2),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        TaylorAdaptive::new(sys(), vec![1.0], f64::INFINITY, 1e-9, 1e-9, 2),
        Err(Error::NonFinite(_))
    ));
    assert!(matches!(
        TaylorAdaptive::new(sys(), vec![1.0], 0.0, -1e-9, 1e-9, 2),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        TaylorAdaptive::new(sys(), vec![1.0], 0.0, 1e-9, 0.0, 2),
        Err(Error::InvalidArgument(_))
    ));
    // log of a negative initial state: the order-0 jet is already NaN.
    assert!(matches!(
        TaylorAdaptive::new(
            vec![(var("x"), log(var("x")))],
            vec![-1.0],
            0.0,
            1e-9,
            1e-9,
            2
        ),
        Err(Error::NonFiniteDerivative)
    ));
}

#[test]
fn setters_validate() {
    let mut ta = harmonic(1e-12);
    assert!(ta.set_state(&[0.1, 0.2]).is_ok());
    assert!(matches!(
        ta.set_state(&[0.1]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        ta.set_state(&[0.1, f64::NAN]),
        Err(Error::NonFinite(_))
    ));
    assert!(ta.set_time(5.0).is_ok());
    assert_eq!(ta.time(), 5.0);
    assert!(matches!(ta.set_time(f64::NAN), Err(Error::NonFinite(_))));
}

#[test]
fn parameters_drive_the_flow() {
    // x' = p0 * x: x(t) = exp(p0 t).
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), par(0) * var("x"))],
        vec![1.0_f64],
        0.0,
        1e-14,
        1e-14,
        2,
    )
    .unwrap();
    assert_eq!(ta.pars(), &[0.0]);
    ta.set_pars(&[2.0]).unwrap();
    ta.propagate_until(1.0, 0).unwrap();
    assert_relative_eq!(ta.state()[0], 2.0_f64.exp(), max_relative = 1e-12);
    assert!(matches!(
        ta.set_pars(&[1.0, 2.0]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn time_dependent_rhs_integrates_exactly() {
    // x' = t: x(t) = x0 + t²/2.
    let mut ta = TaylorAdaptive::new(
        vec![(var("x"), time())],
        vec![0.0_f64],
        0.0,
        1e-12,
        1e-12,
        2,
    )
    .unwrap();
    ta.propagate_until(3.0, 0).unwrap();
    assert_relative_eq!(ta.state()[0], 4.5, max_relative = 1e-13);
}

#[test]
fn clones_are_independent() {
    let mut ta = harmonic(1e-12);
    let mut copy = ta.clone();
    assert_eq!(ta.state(), copy.state());
    assert_eq!(ta.time(), copy.time());

    let (_, h_orig, _) = ta.step();
    assert_eq!(copy.time(), 0.0);
    let (_, h_copy, _) = copy.step();
    // Same starting point, same deduced timestep and state.
    assert_eq!(h_orig, h_copy);
    assert_eq!(ta.state(), copy.state());
}

#[test]
fn single_precision_integrates() {
    let mut ta = TaylorAdaptive32::new(
        vec![(var("x"), var("y")), (var("y"), -var("x"))],
        vec![0.0_f32, 1.0],
        0.0,
        1e-6,
        1e-6,
        2,
    )
    .unwrap();
    ta.propagate_until(1.0, 0).unwrap();
    let [x, y] = [ta.state()[0], ta.state()[1]];
    assert!((x * x + y * y - 1.0).abs() < 1e-4);
    assert_relative_eq!(x, 1.0_f32.sin(), max_relative = 1e-4);
}

#[test]
fn stats_track_orders() {
    let mut ta = harmonic(1e-12);
    let (_, stats) = ta.propagate_until(5.0, 0).unwrap();
    let (order_r, _) = ta.orders();
    assert_eq!(stats.min_order, order_r);
    assert_eq!(stats.max_order, order_r);
}

#[test]
fn inferred_system_matches_explicit() {
    // x' = y, y' = -x written with inferred (alphabetical) variables.
    let mut inferred =
        TaylorAdaptive::new(vec![var("y"), num(0.0) - var("x")], vec![0.0, 1.0], 0.0, 1e-12, 1e-12, 2)
            .unwrap();
    let mut explicit = harmonic(1e-12);
    inferred.propagate_until(1.0, 0).unwrap();
    explicit.propagate_until(1.0, 0).unwrap();
    assert_relative_eq!(inferred.state()[0], explicit.state()[0], max_relative = 1e-12);
    assert_relative_eq!(inferred.state()[1], explicit.state()[1], max_relative = 1e-12);
}
