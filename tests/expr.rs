//! Symbolic/numeric agreement of the registered function derivatives.

use std::collections::HashMap;

use peregrine::{cos, diff, erf, eval, exp, log, pow, sin, sqrt, subs, var, Expr};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn eval_at(e: &Expr, x: f64) -> f64 {
    let mut vars = HashMap::new();
    vars.insert("x".to_string(), x);
    eval(e, &vars, &[], 0.0).unwrap()
}

/// Central difference vs the symbolic derivative, at random points.
fn check_derivative(build: impl Fn(Expr) -> Expr, lo: f64, hi: f64) {
    let mut rng = StdRng::seed_from_u64(7);
    let e = build(var("x"));
    let d = diff(&e, "x");
    for _ in 0..50 {
        let x = rng.gen_range(lo..hi);
        let h = 1e-6 * x.abs().max(1.0);
        let numeric = (eval_at(&e, x + h) - eval_at(&e, x - h)) / (2.0 * h);
        let symbolic = eval_at(&d, x);
        assert!(
            (numeric - symbolic).abs() <= 1e-6 * (1.0 + symbolic.abs()),
            "x = {}: numeric {} vs symbolic {}",
            x,
            numeric,
            symbolic
        );
    }
}

#[test]
fn derivatives_agree_numerically() {
    check_derivative(sin, -3.0, 3.0);
    check_derivative(cos, -3.0, 3.0);
    check_derivative(exp, -2.0, 2.0);
    check_derivative(log, 0.1, 5.0);
    check_derivative(|e| pow(e, 2.7), 0.1, 5.0);
    check_derivative(sqrt, 0.1, 5.0);
    check_derivative(erf, -2.0, 2.0);
    // A composite expression exercising the chain and product rules.
    check_derivative(|e| sin(e.clone() * e.clone()) * exp(-e), -1.5, 1.5);
}

#[test]
fn substitution_composes_with_evaluation() {
    let mut rng = StdRng::seed_from_u64(11);
    let e = sin(var("a")) * var("b") + exp(var("a") / (var("b") + 2.0));
    for _ in 0..20 {
        let x = rng.gen_range(-1.0..1.0);
        let mut m_expr = HashMap::new();
        m_expr.insert("a".to_string(), cos(var("x")));
        m_expr.insert("b".to_string(), var("x") * var("x"));

        let mut m_num = HashMap::new();
        m_num.insert("x".to_string(), x);

        let direct = eval(&subs(&e, &m_expr), &m_num, &[], 0.0).unwrap();

        let mut composed = HashMap::new();
        for (name, repl) in &m_expr {
            composed.insert(name.clone(), eval(repl, &m_num, &[], 0.0).unwrap());
        }
        let via_bindings = eval(&e, &composed, &[], 0.0).unwrap();
        assert!((direct - via_bindings).abs() <= 1e-13 * (1.0 + via_bindings.abs()));
    }
}
