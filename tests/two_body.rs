//! Two-body problem: long-term energy conservation.

use peregrine::{pow, var, Expr, TaylorAdaptive};

/// Mutual inverse-square attraction between two unit masses (G = 1),
/// twelve equations: positions and velocities of both bodies.
fn two_body_sys() -> Vec<(Expr, Expr)> {
    let pos = ["x0", "y0", "z0", "x1", "y1", "z1"];
    let vel = ["vx0", "vy0", "vz0", "vx1", "vy1", "vz1"];

    let dx = var("x1") - var("x0");
    let dy = var("y1") - var("y0");
    let dz = var("z1") - var("z0");
    let r2 = dx.clone() * dx.clone() + dy.clone() * dy.clone() + dz.clone() * dz.clone();
    // 1/r³ as (r²)^(-3/2).
    let inv_r3 = pow(r2, -1.5);

    let mut sys: Vec<(Expr, Expr)> = Vec::new();
    for (p, v) in pos.iter().zip(vel) {
        sys.push((var(*p), var(v)));
    }
    let deltas = [dx, dy, dz];
    for (v, delta) in vel.iter().take(3).zip(deltas.clone()) {
        sys.push((var(*v), delta * inv_r3.clone()));
    }
    for (v, delta) in vel.iter().skip(3).zip(deltas) {
        sys.push((var(*v), -(delta * inv_r3.clone())));
    }
    sys
}

fn initial_state() -> Vec<f64> {
    let p = [0.127537, 1.385958, 0.357329];
    let v = [-0.418613, 0.032225, 0.070830];
    // Body 2 mirrored through the origin.
    let mut state = Vec::with_capacity(12);
    state.extend(p);
    state.extend(p.map(|x| -x));
    state.extend(v);
    state.extend(v.map(|x| -x));
    state
}

fn energy(state: &[f64]) -> f64 {
    let (r0, r1) = (&state[0..3], &state[3..6]);
    let (v0, v1) = (&state[6..9], &state[9..12]);
    let kinetic = 0.5
        * (v0.iter().map(|x| x * x).sum::<f64>() + v1.iter().map(|x| x * x).sum::<f64>());
    let r: f64 = r0
        .iter()
        .zip(r1)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt();
    kinetic - 1.0 / r
}

#[test]
fn energy_drift_stays_small() {
    let mut ta =
        TaylorAdaptive::new(two_body_sys(), initial_state(), 0.0, 1e-15, 1e-15, 2).unwrap();
    let e0 = energy(ta.state());
    ta.propagate_until(100.0, 0).unwrap();
    let drift = ((energy(ta.state()) - e0) / e0).abs();
    assert!(drift <= 1e-12, "relative energy drift {} too large", drift);
}

#[test]
#[ignore = "long-term propagation, minutes of runtime"]
fn energy_drift_long_term() {
    let mut ta =
        TaylorAdaptive::new(two_body_sys(), initial_state(), 0.0, 1e-15, 1e-15, 2).unwrap();
    let e0 = energy(ta.state());
    ta.propagate_until(3e8, 0).unwrap();
    let drift = ((energy(ta.state()) - e0) / e0).abs();
    assert!(drift <= 1e-12, "relative energy drift {} too large", drift);
}
