//! Affine expressions over program columns and the program builder shared by
//! the distribution and transmission formulations.

use crate::solver;
use std::collections::BTreeMap;
use std::ops::RangeBounds;

/// An affine function `constant + sum(coef * x[col])` of program columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinExpr {
    pub terms: Vec<(usize, f64)>,
    pub constant: f64,
}

impl LinExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self {
            terms: vec![],
            constant: value,
        }
    }

    pub fn term(col: usize, coef: f64) -> Self {
        Self {
            terms: vec![(col, coef)],
            constant: 0.0,
        }
    }

    pub fn add_term(&mut self, col: usize, coef: f64) -> &mut Self {
        if coef != 0.0 {
            self.terms.push((col, coef));
        }
        self
    }

    pub fn add_constant(&mut self, value: f64) -> &mut Self {
        self.constant += value;
        self
    }

    pub fn add_scaled(&mut self, other: &LinExpr, factor: f64) -> &mut Self {
        if factor == 0.0 {
            return self;
        }
        for &(col, coef) in other.terms.iter() {
            self.add_term(col, coef * factor);
        }
        self.constant += other.constant * factor;
        self
    }

    pub fn scaled(&self, factor: f64) -> LinExpr {
        let mut expr = LinExpr::new();
        expr.add_scaled(self, factor);
        expr
    }

    /// Merges repeated columns and drops zero coefficients, keeping the
    /// columns sorted.
    pub fn compact(&self) -> LinExpr {
        let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
        for &(col, coef) in self.terms.iter() {
            *merged.entry(col).or_insert(0.0) += coef;
        }
        LinExpr {
            terms: merged
                .into_iter()
                .filter(|(_, coef)| *coef != 0.0)
                .collect(),
            constant: self.constant,
        }
    }

    pub fn eval(&self, primal: &[f64]) -> f64 {
        self.terms
            .iter()
            .fold(self.constant, |acc, &(col, coef)| acc + coef * primal[col])
    }
}

/// A convex (linear) program under construction: columns, rows and an
/// objective accumulated from cost and risk terms.
#[derive(Debug, Default)]
pub struct Program {
    problem: solver::Problem,
    scenario_count: Option<usize>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column<B: RangeBounds<f64>>(
        &mut self,
        cost: f64,
        bounds: B,
    ) -> usize {
        self.problem.add_column(cost, bounds)
    }

    pub fn num_columns(&self) -> usize {
        self.problem.num_col
    }

    pub fn column_bounds(&self, col: usize) -> (f64, f64) {
        (self.problem.col_lower[col], self.problem.col_upper[col])
    }

    /// Adds `expr` to the minimised objective.
    pub fn add_objective(&mut self, expr: &LinExpr) {
        for &(col, coef) in expr.terms.iter() {
            self.problem.col_cost[col] += coef;
        }
        self.problem.offset += expr.constant;
    }

    /// Adds the row `lower <= expr <= upper`, moving the constant to the
    /// bounds.
    pub fn add_constraint(
        &mut self,
        expr: &LinExpr,
        lower: f64,
        upper: f64,
    ) -> usize {
        let expr = expr.compact();
        self.problem
            .add_row(lower - expr.constant, upper - expr.constant, &expr.terms)
    }

    pub fn add_le(&mut self, expr: &LinExpr, rhs: f64) -> usize {
        self.add_constraint(expr, f64::NEG_INFINITY, rhs)
    }

    pub fn add_ge(&mut self, expr: &LinExpr, rhs: f64) -> usize {
        self.add_constraint(expr, rhs, f64::INFINITY)
    }

    pub fn add_eq(&mut self, expr: &LinExpr, rhs: f64) -> usize {
        self.add_constraint(expr, rhs, rhs)
    }

    /// Registers the empirical sample size used by a risk constraint. Every
    /// risk constraint of one program must share it.
    pub fn register_scenario_count(
        &mut self,
        count: usize,
    ) -> Result<(), usize> {
        match self.scenario_count {
            Some(existing) if existing != count => Err(existing),
            _ => {
                self.scenario_count = Some(count);
                Ok(())
            }
        }
    }

    pub fn scenario_count(&self) -> Option<usize> {
        self.scenario_count
    }

    pub fn solve<O: solver::SolverOracle + ?Sized>(
        self,
        oracle: &O,
    ) -> solver::SolveOutcome {
        oracle.solve(self.problem)
    }
}
