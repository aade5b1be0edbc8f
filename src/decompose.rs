//! Taylor decomposition.
//!
//! Lowers a system of n right-hand sides into an ordered list of u-variable
//! definitions: n leading state-variable leaves, a run of elementary
//! intermediate definitions (each a binary node, a function call or a
//! parameter/time leaf whose operands reference only earlier u-indices,
//! numbers, parameters or the time placeholder), and n trailing entries
//! holding the right-hand sides as u-references or numbers.
//!
//! Common sub-expressions are eliminated after lowering; in debug builds the
//! list is verified against the structural invariants and against a full
//! reconstruction of the original right-hand sides.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::debug;

use crate::error::Error;
use crate::expr::{get_variables, rename_variables, var, Expr};
#[cfg(debug_assertions)]
use crate::expr::subs;

/// A system of ODEs: right-hand sides with implicitly deduced state
/// variables, or explicit `(lhs, rhs)` pairs.
#[derive(Clone, Debug)]
pub enum System {
    /// Right-hand sides only; the state variables are the variables
    /// appearing in them, in alphabetical order.
    Inferred(Vec<Expr>),
    /// Explicit `(variable, rhs)` pairs; the state ordering follows the
    /// left-hand sides.
    Explicit(Vec<(Expr, Expr)>),
}

impl From<Vec<Expr>> for System {
    fn from(v: Vec<Expr>) -> Self {
        System::Inferred(v)
    }
}

impl From<Vec<(Expr, Expr)>> for System {
    fn from(v: Vec<(Expr, Expr)>) -> Self {
        System::Explicit(v)
    }
}

impl System {
    /// Number of equations.
    pub fn len(&self) -> usize {
        match self {
            System::Inferred(v) => v.len(),
            System::Explicit(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The u-variable name for index `i`.
#[inline]
pub(crate) fn uvar(i: usize) -> Expr {
    var(format!("u_{}", i))
}

/// Parse a `u_<index>` name back to its index.
#[inline]
pub(crate) fn uname_to_index(name: &str) -> Option<usize> {
    name.strip_prefix("u_").and_then(|s| s.parse().ok())
}

/// Decompose `ex` onto `dc`, appending the elementary definitions it
/// expands into. Returns the index of the entry representing `ex`, or 0 if
/// `ex` is a leaf and nothing was appended.
pub(crate) fn decompose_in_place(ex: Expr, dc: &mut Vec<Expr>) -> usize {
    match ex {
        Expr::Bin(op, lhs, rhs) => {
            let lhs = decompose_operand(*lhs, dc);
            let rhs = decompose_operand(*rhs, dc);
            dc.push(Expr::Bin(op, Box::new(lhs), Box::new(rhs)));
            dc.len() - 1
        }
        Expr::Call(func) => (func.decompose_fn())(func, dc),
        _ => 0,
    }
}

/// Decompose a sub-expression into operand position: leaves stay inline,
/// anything else becomes a reference to its decomposed entry.
pub(crate) fn decompose_operand(ex: Expr, dc: &mut Vec<Expr>) -> Expr {
    match ex {
        Expr::Num(_) | Expr::Var(_) | Expr::Par(_) | Expr::Time => ex,
        other => uvar(decompose_in_place(other, dc)),
    }
}

/// An ordered, CSE-simplified list of u-variable definitions for a system
/// of ODEs.
#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    dc: Vec<Expr>,
    n_eq: usize,
}

impl Decomposition {
    /// Decompose a system.
    pub fn new(sys: impl Into<System>) -> Result<Self, Error> {
        match sys.into() {
            System::Inferred(v) => Self::from_rhs(v),
            System::Explicit(v) => Self::from_pairs(v),
        }
    }

    fn from_rhs(v_ex: Vec<Expr>) -> Result<Self, Error> {
        if v_ex.is_empty() {
            return Err(Error::EmptySystem);
        }

        // Deduce the state variables, in alphabetical order.
        let mut vars: Vec<String> = Vec::new();
        for ex in &v_ex {
            vars.extend(get_variables(ex));
        }
        vars.sort();
        vars.dedup();

        if vars.len() != v_ex.len() {
            return Err(Error::AritySystemMismatch {
                n_vars: vars.len(),
                n_eq: v_ex.len(),
            });
        }

        Self::build(vars, v_ex)
    }

    fn from_pairs(sys: Vec<(Expr, Expr)>) -> Result<Self, Error> {
        if sys.is_empty() {
            return Err(Error::EmptySystem);
        }

        // Every lhs must be a distinct variable; every rhs variable must
        // appear among the lhs names.
        let mut lhs_vars: Vec<String> = Vec::new();
        let mut lhs_set: HashSet<String> = HashSet::new();
        let mut rhs_set: HashSet<String> = HashSet::new();
        for (lhs, rhs) in &sys {
            match lhs {
                Expr::Var(name) => {
                    if !lhs_set.insert(name.clone()) {
                        return Err(Error::DuplicateLhs(name.clone()));
                    }
                    lhs_vars.push(name.clone());
                }
                other => return Err(Error::NonVariableLhs(other.to_string())),
            }
            rhs_set.extend(get_variables(rhs));
        }
        for name in rhs_set {
            if !lhs_set.contains(&name) {
                return Err(Error::UnknownRhsVariable(name));
            }
        }

        let rhs: Vec<Expr> = sys.into_iter().map(|(_, rhs)| rhs).collect();
        Self::build(lhs_vars, rhs)
    }

    /// Shared tail of both entry points: `vars[i]` is the state variable
    /// that becomes `u_i`, `rhs` the right-hand sides in that order.
    fn build(vars: Vec<String>, mut rhs: Vec<Expr>) -> Result<Self, Error> {
        let n_eq = rhs.len();

        #[cfg(debug_assertions)]
        let orig_rhs = rhs.clone();

        let repl_map: HashMap<String, String> = vars
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), format!("u_{}", i)))
            .collect();
        for ex in &mut rhs {
            rename_variables(ex, &repl_map);
        }

        // The list opens with the state variables under their original
        // names; u-references index into it.
        let mut dc: Vec<Expr> = vars.into_iter().map(var).collect();

        // Decompose each equation, remembering what its tail entry is.
        let mut tails = Vec::with_capacity(n_eq);
        for ex in rhs {
            let keep = ex.clone();
            let dres = decompose_in_place(ex, &mut dc);
            if dres > 0 {
                tails.push(uvar(dres));
            } else {
                match keep {
                    // A bare parameter or time right-hand side becomes its
                    // own u-variable so the tail stays {u-ref | number}.
                    Expr::Par(_) | Expr::Time => {
                        dc.push(keep);
                        tails.push(uvar(dc.len() - 1));
                    }
                    other => tails.push(other),
                }
            }
        }
        dc.extend(tails);

        #[cfg(debug_assertions)]
        verify(&orig_rhs, &dc);

        let before = dc.len();
        let dc = cse(dc, n_eq);
        debug!(
            "taylor decomposition: {} equation(s), {} u-variable(s) ({} before CSE)",
            n_eq,
            dc.len(),
            before
        );

        #[cfg(debug_assertions)]
        verify(&orig_rhs, &dc);

        Ok(Decomposition { dc, n_eq })
    }

    /// Number of equations (= state variables).
    #[inline]
    pub fn n_eq(&self) -> usize {
        self.n_eq
    }

    /// Total number of u-variables.
    #[inline]
    pub fn len(&self) -> usize {
        self.dc.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dc.is_empty()
    }

    /// The ordered u-variable definitions.
    #[inline]
    pub fn entries(&self) -> &[Expr] {
        &self.dc
    }
}

impl fmt::Display for Decomposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ex) in self.dc.iter().enumerate() {
            writeln!(f, "u_{} = {}", i, ex)?;
        }
        Ok(())
    }
}

/// Remove duplicate intermediate definitions.
///
/// Keeps an expression→index map over the rewritten entries and a u-variable
/// rename map; on a duplicate the entry is dropped and its name remapped to
/// the earliest occurrence. The terminal entries are rewritten under the
/// final rename map and appended unchanged in structure.
fn cse(mut dc: Vec<Expr>, n_eq: usize) -> Vec<Expr> {
    let len = dc.len();
    debug_assert!(len >= n_eq * 2);

    let mut out: Vec<Expr> = Vec::with_capacity(len);
    let mut seen: HashMap<Expr, usize> = HashMap::new();
    let mut rename: HashMap<String, String> = HashMap::new();

    for ex in dc.drain(..n_eq) {
        out.push(ex);
    }
    let tail_start = len - 2 * n_eq;
    let mut tail = dc.split_off(tail_start);

    for (offset, mut ex) in dc.into_iter().enumerate() {
        let i = n_eq + offset;
        rename_variables(&mut ex, &rename);
        if let Some(&j) = seen.get(&ex) {
            rename.insert(format!("u_{}", i), format!("u_{}", j));
        } else {
            out.push(ex.clone());
            let new_idx = out.len() - 1;
            seen.insert(ex, new_idx);
            rename.insert(format!("u_{}", i), format!("u_{}", new_idx));
        }
    }

    for ex in &mut tail {
        rename_variables(ex, &rename);
    }
    out.append(&mut tail);
    out
}

/// Structural verification of a decomposition (debug builds only).
#[cfg(debug_assertions)]
fn verify(orig_rhs: &[Expr], dc: &[Expr]) {
    let n_eq = orig_rhs.len();
    assert!(dc.len() >= n_eq * 2);

    for entry in dc.iter().take(n_eq) {
        assert!(matches!(entry, Expr::Var(_)));
    }

    for (i, entry) in dc.iter().enumerate().take(dc.len() - n_eq).skip(n_eq) {
        for name in get_variables(entry) {
            let k = uname_to_index(&name).expect("non u-variable in an intermediate entry");
            assert!(k < i);
        }
    }

    for (i, entry) in dc.iter().enumerate().skip(dc.len() - n_eq) {
        match entry {
            Expr::Var(name) => {
                let k = uname_to_index(name).expect("non u-variable in a terminal entry");
                assert!(k < i);
            }
            Expr::Num(_) => {}
            other => panic!("invalid terminal entry '{}'", other),
        }
    }

    // Substituting from the top down must reconstruct the right-hand sides.
    let mut subs_map: HashMap<String, Expr> = HashMap::new();
    for (i, entry) in dc.iter().enumerate().take(dc.len() - n_eq) {
        let expanded = subs(&strip_hidden(entry), &subs_map);
        subs_map.insert(format!("u_{}", i), expanded);
    }
    for (i, entry) in dc.iter().enumerate().skip(dc.len() - n_eq) {
        assert_eq!(subs(entry, &subs_map), orig_rhs[i - (dc.len() - n_eq)]);
    }
}

/// Drop hidden-dependency arguments so an entry matches what the user wrote.
#[cfg(debug_assertions)]
fn strip_hidden(e: &Expr) -> Expr {
    match e {
        Expr::Call(f) if f.name() == "erf" && f.args().len() == 2 => {
            let mut f = f.clone();
            f.args_mut().truncate(1);
            Expr::Call(f)
        }
        _ => e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::func::{cos, erf, exp, sin};
    use crate::expr::{num, par, time, var};

    #[test]
    fn empty_system_is_rejected() {
        assert!(matches!(
            Decomposition::new(Vec::<Expr>::new()),
            Err(Error::EmptySystem)
        ));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        // One equation, two deduced variables.
        assert!(matches!(
            Decomposition::new(vec![var("x") + var("y")]),
            Err(Error::AritySystemMismatch { n_vars: 2, n_eq: 1 })
        ));
    }

    #[test]
    fn explicit_system_validation() {
        assert!(matches!(
            Decomposition::new(vec![(num(1.0), var("x"))]),
            Err(Error::NonVariableLhs(_))
        ));
        assert!(matches!(
            Decomposition::new(vec![
                (var("x"), var("x")),
                (var("x"), var("x")),
            ]),
            Err(Error::DuplicateLhs(name)) if name == "x"
        ));
        assert!(matches!(
            Decomposition::new(vec![(var("x"), var("x") * var("q"))]),
            Err(Error::UnknownRhsVariable(name)) if name == "q"
        ));
    }

    #[test]
    fn pendulum_layout() {
        // x' = v, v' = -sin(x): two leaves, one sin/cos pair, two tails.
        let dc = Decomposition::new(vec![
            (var("x"), var("v")),
            (var("v"), -sin(var("x"))),
        ])
        .unwrap();
        let entries = dc.entries();
        assert_eq!(dc.n_eq(), 2);
        assert_eq!(entries[0], var("x"));
        assert_eq!(entries[1], var("v"));
        assert_eq!(entries[2], sin(var("u_0")));
        assert_eq!(entries[3], cos(var("u_0")));
        // -sin(x) is (-1) * u_2.
        assert_eq!(entries[4], num(-1.0) * var("u_2"));
        assert_eq!(entries[5], var("u_1"));
        assert_eq!(entries[6], var("u_4"));
    }

    #[test]
    fn sin_cos_pairs_stay_adjacent() {
        let dc = Decomposition::new(vec![
            (var("x"), cos(var("y")) + sin(var("x")) * sin(var("y"))),
            (var("y"), sin(var("x")) - cos(var("y"))),
        ])
        .unwrap();
        let entries = dc.entries();
        for (i, entry) in entries.iter().enumerate() {
            if let Expr::Call(f) = entry {
                match f.name() {
                    "sin" => {
                        assert_eq!(entries[i + 1], cos(f.args()[0].clone()));
                    }
                    "cos" => {
                        assert_eq!(entries[i - 1], sin(f.args()[0].clone()));
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn cse_merges_shared_subexpressions() {
        // exp(-(x+y)^2) + erf(x+y): one x+y entry, and the erf auxiliary
        // collapses onto the user-written exponential.
        let s = var("x") + var("y");
        let dc = Decomposition::new(vec![
            (var("x"), exp(-(s.clone() * s.clone())) + erf(s)),
            (var("y"), num(1.0)),
        ])
        .unwrap();
        let adds = dc
            .entries()
            .iter()
            .filter(|e| **e == var("u_0") + var("u_1"))
            .count();
        assert_eq!(adds, 1);
        let exps = dc
            .entries()
            .iter()
            .filter(|e| matches!(e, Expr::Call(f) if f.name() == "exp"))
            .count();
        assert_eq!(exps, 1);
        // The erf entry's hidden argument points at that exponential.
        let erf_entry = dc
            .entries()
            .iter()
            .find_map(|e| match e {
                Expr::Call(f) if f.name() == "erf" => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(erf_entry.args().len(), 2);
        let g = match &erf_entry.args()[1] {
            Expr::Var(name) => uname_to_index(name).unwrap(),
            other => panic!("unexpected hidden argument '{}'", other),
        };
        assert!(matches!(&dc.entries()[g], Expr::Call(f) if f.name() == "exp"));
    }

    #[test]
    fn cse_is_idempotent() {
        let s = var("x") + var("y");
        let dc = Decomposition::new(vec![
            (var("x"), exp(-(s.clone() * s.clone())) + erf(s)),
            (var("y"), sin(var("x")) * sin(var("x"))),
        ])
        .unwrap();
        let again = cse(dc.entries().to_vec(), dc.n_eq());
        assert_eq!(again, dc.entries());
    }

    #[test]
    fn bare_time_and_parameter_rhs() {
        let dc = Decomposition::new(vec![
            (var("x"), time()),
            (var("y"), par(0)),
        ])
        .unwrap();
        let entries = dc.entries();
        assert_eq!(entries[2], time());
        assert_eq!(entries[3], par(0));
        assert_eq!(entries[4], var("u_2"));
        assert_eq!(entries[5], var("u_3"));
    }

    #[test]
    fn inferred_ordering_is_alphabetical() {
        // Inferred variables sort alphabetically: a maps to u_0, and the
        // first right-hand side belongs to a.
        let dc = Decomposition::new(vec![var("b"), var("a")]).unwrap();
        let entries = dc.entries();
        assert_eq!(entries[0], var("a"));
        assert_eq!(entries[1], var("b"));
        // d(a)/dt = b = u_1, d(b)/dt = a = u_0.
        assert_eq!(entries[2], var("u_1"));
        assert_eq!(entries[3], var("u_0"));
    }
}
