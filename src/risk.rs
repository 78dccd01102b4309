//! Wasserstein-ball CVaR robust counterpart of a single operational limit.
//!
//! A risk constraint is described by its violation `g(x, ξ_i)` in every
//! scenario `i` (affine in the decision columns once the scenario data is
//! fixed) and by the gradient of `g` with respect to the uncertain vector
//! `ξ`. For a risk weight `ρ`, tolerance `α` and radius `ε` the builder
//! adds
//!
//! ```text
//! t <= 0                                    (value-at-risk proxy)
//! s_i >= ρ (g_i(x) + t - α t),  s_i >= -ρ α t   for every scenario i
//! λ   >= ρ ‖∇_ξ g(x)‖_*                      (transport dual norm)
//! ```
//!
//! and contributes `(Σ s_i) / N + ε λ` to the minimised objective. With
//! `ε = 0` the same rows reduce to the sample-average CVaR.

use crate::program::{LinExpr, Program};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of operational limits enforced in the CVaR sense.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    VoltageUpper,
    VoltageLower,
    ApparentPower,
    LineFlow,
}

/// Norm of the Wasserstein transportation cost. The robust counterpart
/// bounds the gradient in the corresponding dual norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportNorm {
    /// ℓ1 transport cost, ℓ∞ dual bound
    #[default]
    L1,
    /// ℓ∞ transport cost, ℓ1 dual bound
    LInf,
}

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("risk weight must be positive, got {0}")]
    InvalidRiskWeight(f64),
    #[error("Wasserstein radius must be non-negative, got {0}")]
    InvalidRadius(f64),
    #[error("violation tolerance must lie in (0, 1], got {0}")]
    InvalidTolerance(f64),
    #[error("risk constraint {0} has no scenarios")]
    EmptyScenarioSet(String),
    #[error(
        "risk constraint {label} uses {found} scenarios \
         but the program shares {expected}"
    )]
    ScenarioCountMismatch {
        label: String,
        expected: usize,
        found: usize,
    },
}

/// Risk weight, radius and tolerance of one solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskParams {
    pub rho: f64,
    pub epsilon: f64,
    pub alpha: f64,
    pub norm: TransportNorm,
}

impl RiskParams {
    pub fn new(
        rho: f64,
        epsilon: f64,
        alpha: f64,
        norm: TransportNorm,
    ) -> Result<Self, RiskError> {
        if !(rho > 0.0 && rho.is_finite()) {
            return Err(RiskError::InvalidRiskWeight(rho));
        }
        if !(epsilon >= 0.0 && epsilon.is_finite()) {
            return Err(RiskError::InvalidRadius(epsilon));
        }
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(RiskError::InvalidTolerance(alpha));
        }
        Ok(Self {
            rho,
            epsilon,
            alpha,
            norm,
        })
    }
}

/// One operational limit ready to be reformulated.
#[derive(Debug, Clone)]
pub struct RiskConstraint {
    pub label: String,
    pub kind: ConstraintKind,
    /// `g(x, ξ_i)` for each scenario, positive when the limit is violated
    pub violations: Vec<LinExpr>,
    /// `∂g/∂ξ_k` for each uncertain component `k`
    pub gradient: Vec<LinExpr>,
}

/// Columns introduced for one risk constraint.
#[derive(Debug, Clone)]
pub struct RiskAccessors {
    pub label: String,
    pub kind: ConstraintKind,
    pub value_at_risk: usize,
    pub slacks: Vec<usize>,
    pub dual_norm: usize,
    pub dual_aux: Vec<usize>,
}

/// Per-constraint decomposition of the risk term at an optimum.
#[derive(Debug, Clone, Serialize)]
pub struct CvarBreakdown {
    pub label: String,
    pub kind: ConstraintKind,
    pub contribution: f64,
    pub cvar: f64,
    pub value_at_risk: f64,
    pub dual_norm: f64,
}

impl RiskAccessors {
    /// `(Σ s_i)/N + ε λ` evaluated at a primal assignment.
    pub fn contribution(&self, primal: &[f64], params: &RiskParams) -> f64 {
        let n = self.slacks.len() as f64;
        let slack_sum: f64 = self.slacks.iter().map(|s| primal[*s]).sum();
        slack_sum / n + params.epsilon * primal[self.dual_norm]
    }

    pub fn breakdown(
        &self,
        primal: &[f64],
        params: &RiskParams,
    ) -> CvarBreakdown {
        let contribution = self.contribution(primal, params);
        CvarBreakdown {
            label: self.label.clone(),
            kind: self.kind,
            contribution,
            cvar: contribution / params.rho,
            value_at_risk: primal[self.value_at_risk],
            dual_norm: primal[self.dual_norm],
        }
    }
}

fn is_zero(expr: &LinExpr) -> bool {
    expr.constant == 0.0 && expr.terms.iter().all(|(_, coef)| *coef == 0.0)
}

/// Adds the robust counterpart of `constraint` to `program`, including its
/// objective contribution.
pub fn add_risk_constraint(
    program: &mut Program,
    constraint: &RiskConstraint,
    params: &RiskParams,
) -> Result<RiskAccessors, RiskError> {
    let num_scenarios = constraint.violations.len();
    if num_scenarios == 0 {
        return Err(RiskError::EmptyScenarioSet(constraint.label.clone()));
    }
    program.register_scenario_count(num_scenarios).map_err(|expected| {
        RiskError::ScenarioCountMismatch {
            label: constraint.label.clone(),
            expected,
            found: num_scenarios,
        }
    })?;

    let rho = params.rho;
    let alpha = params.alpha;
    let weight = 1.0 / num_scenarios as f64;

    let value_at_risk = program.add_column(0.0, f64::NEG_INFINITY..=0.0);
    let mut slacks = Vec::<usize>::with_capacity(num_scenarios);
    for violation in constraint.violations.iter() {
        let s = program.add_column(weight, ..);
        // s - ρ g - ρ (1 - α) t >= 0
        let mut upper_piece = LinExpr::term(s, 1.0);
        upper_piece
            .add_scaled(violation, -rho)
            .add_term(value_at_risk, -rho * (1.0 - alpha));
        program.add_ge(&upper_piece, 0.0);
        // s + ρ α t >= 0
        let mut lower_piece = LinExpr::term(s, 1.0);
        lower_piece.add_term(value_at_risk, rho * alpha);
        program.add_ge(&lower_piece, 0.0);
        slacks.push(s);
    }

    let dual_norm = program.add_column(params.epsilon, 0.0..);
    let mut dual_aux = Vec::<usize>::new();
    for component in constraint.gradient.iter().filter(|g| !is_zero(g)) {
        let bound = match params.norm {
            TransportNorm::L1 => dual_norm,
            TransportNorm::LInf => {
                let u = program.add_column(0.0, 0.0..);
                dual_aux.push(u);
                u
            }
        };
        for sign in [1.0, -1.0] {
            let mut row = LinExpr::term(bound, 1.0);
            row.add_scaled(component, -sign * rho);
            program.add_ge(&row, 0.0);
        }
    }
    if !dual_aux.is_empty() {
        let mut row = LinExpr::term(dual_norm, 1.0);
        for u in dual_aux.iter() {
            row.add_term(*u, -1.0);
        }
        program.add_ge(&row, 0.0);
    }

    Ok(RiskAccessors {
        label: constraint.label.clone(),
        kind: constraint.kind,
        value_at_risk,
        slacks,
        dual_norm,
        dual_aux,
    })
}

fn cvar_objective(values: &[f64], alpha: f64, t: f64) -> f64 {
    let n = values.len() as f64;
    values
        .iter()
        .map(|g| (g + (1.0 - alpha) * t).max(-alpha * t))
        .sum::<f64>()
        / n
}

/// Sample-average value of the CVaR program for fixed violations `values`
/// (ρ = 1, ε = 0). The objective is piecewise linear in `t`, so the minimum
/// over `t <= 0` sits at `t = 0` or at a breakpoint `t = -g_i`.
pub fn empirical_cvar(values: &[f64], alpha: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values
        .iter()
        .map(|g| -g)
        .filter(|t| *t <= 0.0)
        .chain(std::iter::once(0.0))
        .map(|t| cvar_objective(values, alpha, t))
        .fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{HighsOracle, SolveStatus};

    fn constant_constraint(values: &[f64], gradient: &[f64]) -> RiskConstraint {
        RiskConstraint {
            label: "test".to_string(),
            kind: ConstraintKind::LineFlow,
            violations: values.iter().map(|v| LinExpr::constant(*v)).collect(),
            gradient: gradient.iter().map(|g| LinExpr::constant(*g)).collect(),
        }
    }

    fn solve_contribution(
        constraint: &RiskConstraint,
        params: &RiskParams,
    ) -> (f64, f64) {
        let mut program = Program::new();
        let accessors =
            add_risk_constraint(&mut program, constraint, params).unwrap();
        let outcome = program.solve(&HighsOracle::default());
        assert_eq!(outcome.status, SolveStatus::Optimal);
        let primal = outcome.primal.unwrap();
        (
            accessors.contribution(&primal, params),
            outcome.objective.unwrap(),
        )
    }

    #[test]
    fn test_inactive_constraint_has_zero_cvar() {
        // threshold 1.0, all scenario values at 0.5
        let constraint = constant_constraint(&[-0.5, -0.5, -0.5], &[]);
        let params = RiskParams::new(1.0, 0.0, 0.1, TransportNorm::L1).unwrap();
        let (contribution, objective) =
            solve_contribution(&constraint, &params);
        assert!(contribution.abs() < 1e-7);
        assert!(objective.abs() < 1e-7);
    }

    #[test]
    fn test_hand_computed_cvar() {
        // threshold 1.0, scenario values 0.5, 1.5 and 2.5
        let constraint = constant_constraint(&[-0.5, 0.5, 1.5], &[]);
        let params = RiskParams::new(1.0, 0.0, 0.1, TransportNorm::L1).unwrap();
        let (contribution, _) = solve_contribution(&constraint, &params);
        assert!((contribution - 0.15).abs() < 1e-7);
        assert!((empirical_cvar(&[-0.5, 0.5, 1.5], 0.1) - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_zero_radius_matches_sample_average_cvar() {
        let values = [-1.2, 0.3, 0.05, 2.0, -0.4, 0.9, 1.1];
        for alpha in [0.05, 0.2, 0.5, 1.0] {
            let constraint = constant_constraint(&values, &[0.4, -1.3]);
            let params =
                RiskParams::new(1.0, 0.0, alpha, TransportNorm::L1).unwrap();
            let (contribution, _) = solve_contribution(&constraint, &params);
            assert!(
                (contribution - empirical_cvar(&values, alpha)).abs() < 1e-6,
                "alpha {alpha}"
            );
        }
    }

    #[test]
    fn test_radius_adds_dual_norm_penalty() {
        let values = [-0.5, 0.5, 1.5];
        let base = empirical_cvar(&values, 0.1);

        let constraint = constant_constraint(&values, &[0.3, -0.7]);
        let params = RiskParams::new(1.0, 0.5, 0.1, TransportNorm::L1).unwrap();
        let (contribution, _) = solve_contribution(&constraint, &params);
        assert!((contribution - (base + 0.5 * 0.7)).abs() < 1e-6);

        let params =
            RiskParams::new(1.0, 0.5, 0.1, TransportNorm::LInf).unwrap();
        let (contribution, _) = solve_contribution(&constraint, &params);
        assert!((contribution - (base + 0.5 * 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_risk_weight_scales_contribution() {
        let values = [-0.5, 0.5, 1.5];
        let constraint = constant_constraint(&values, &[1.0]);
        let params = RiskParams::new(4.0, 0.2, 0.1, TransportNorm::L1).unwrap();
        let mut program = Program::new();
        let accessors =
            add_risk_constraint(&mut program, &constraint, &params).unwrap();
        let outcome = program.solve(&HighsOracle::default());
        let breakdown = accessors.breakdown(&outcome.primal.unwrap(), &params);
        let expected = empirical_cvar(&values, 0.1) + 0.2;
        assert!((breakdown.cvar - expected).abs() < 1e-6);
        assert!((breakdown.contribution - 4.0 * expected).abs() < 1e-6);
    }

    #[test]
    fn test_decision_reduces_violation_when_cheap() {
        // g_i = d_i - x with x in [0, 3] costing 0.01 per unit
        let mut program = Program::new();
        let x = program.add_column(0.01, 0.0..=3.0);
        let constraint = RiskConstraint {
            label: "shift".to_string(),
            kind: ConstraintKind::VoltageUpper,
            violations: [0.5, 1.0, 2.0]
                .iter()
                .map(|d| {
                    let mut g = LinExpr::constant(*d);
                    g.add_term(x, -1.0);
                    g
                })
                .collect(),
            gradient: vec![LinExpr::constant(1.0)],
        };
        let params =
            RiskParams::new(10.0, 0.0, 0.1, TransportNorm::L1).unwrap();
        add_risk_constraint(&mut program, &constraint, &params).unwrap();
        let outcome = program.solve(&HighsOracle::default());
        let primal = outcome.primal.unwrap();
        assert!((primal[x] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_accessor_shape() {
        let constraint = constant_constraint(&[0.0; 5], &[1.0, 0.0, 2.0]);
        let params =
            RiskParams::new(1.0, 0.1, 0.1, TransportNorm::LInf).unwrap();
        let mut program = Program::new();
        let accessors =
            add_risk_constraint(&mut program, &constraint, &params).unwrap();
        assert_eq!(accessors.slacks.len(), 5);
        // the zero gradient component needs no auxiliary
        assert_eq!(accessors.dual_aux.len(), 2);
        assert_eq!(program.num_columns(), 1 + 5 + 1 + 2);
    }

    #[test]
    fn test_mismatched_scenario_count_is_rejected() {
        let params = RiskParams::new(1.0, 0.0, 0.1, TransportNorm::L1).unwrap();
        let mut program = Program::new();
        add_risk_constraint(
            &mut program,
            &constant_constraint(&[0.0; 3], &[]),
            &params,
        )
        .unwrap();
        let err = add_risk_constraint(
            &mut program,
            &constant_constraint(&[0.0; 4], &[]),
            &params,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RiskError::ScenarioCountMismatch {
                label: "test".to_string(),
                expected: 3,
                found: 4
            }
        );
    }

    #[test]
    fn test_invalid_params() {
        assert!(RiskParams::new(0.0, 0.0, 0.1, TransportNorm::L1).is_err());
        assert!(RiskParams::new(1.0, -0.1, 0.1, TransportNorm::L1).is_err());
        assert!(RiskParams::new(1.0, 0.0, 0.0, TransportNorm::L1).is_err());
        assert!(RiskParams::new(1.0, 0.0, 1.5, TransportNorm::L1).is_err());
    }
}
