//! Thin HiGHS binding used as the solver oracle of every formulated program.
//!
//! Only the column-wise LP path of the C API is wrapped: a [Problem] is
//! assembled row by row, handed to HiGHS once, solved, and the primal
//! assignment is read back. Callers never see HiGHS statuses directly; they
//! get a [SolveOutcome] whose [SolveStatus] is one of optimal, infeasible or
//! failed.

use std::ffi::{c_void, CString};
use std::num::TryFromIntError;
use std::ops::{Bound, RangeBounds};
use std::os::raw::c_int;

use highs_sys::*;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HighsError {
    #[error("HiGHS call {0} returned an error")]
    Call(&'static str),
    #[error("could not set HiGHS option {0}")]
    Option(&'static str),
    #[error("program too large for HiGHS: {0}")]
    Size(#[from] TryFromIntError),
}

/// Typed value of a HiGHS option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i32),
    Float(f64),
    Text(&'static str),
}

/// A linear program assembled row by row, stored column-wise.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Problem {
    pub num_col: usize,
    pub num_row: usize,
    pub num_nz: usize,
    pub offset: f64,
    pub col_cost: Vec<f64>,
    pub col_lower: Vec<f64>,
    pub col_upper: Vec<f64>,
    pub row_lower: Vec<f64>,
    pub row_upper: Vec<f64>,
    columns: Vec<(Vec<c_int>, Vec<f64>)>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `lower <= Σ factor * column <= upper`. Each column may appear at
    /// most once in `factors`.
    pub fn add_row(
        &mut self,
        lower: f64,
        upper: f64,
        factors: &[(usize, f64)],
    ) -> usize {
        let row = self.num_row as c_int;
        for &(col, factor) in factors {
            let (rows, values) = &mut self.columns[col];
            rows.push(row);
            values.push(factor);
        }
        self.num_nz += factors.len();
        self.row_lower.push(lower);
        self.row_upper.push(upper);
        self.num_row += 1;
        self.num_row - 1
    }

    pub fn add_column<B: RangeBounds<f64>>(
        &mut self,
        cost: f64,
        bounds: B,
    ) -> usize {
        let lower = match bounds.start_bound() {
            Bound::Included(v) | Bound::Excluded(v) => *v,
            Bound::Unbounded => f64::NEG_INFINITY,
        };
        let upper = match bounds.end_bound() {
            Bound::Included(v) | Bound::Excluded(v) => *v,
            Bound::Unbounded => f64::INFINITY,
        };
        self.col_cost.push(cost);
        self.col_lower.push(lower);
        self.col_upper.push(upper);
        self.columns.push((vec![], vec![]));
        self.num_col += 1;
        self.num_col - 1
    }

    /// Column starts, row indices and values of the constraint matrix.
    fn compressed_columns(&self) -> (Vec<c_int>, Vec<c_int>, Vec<f64>) {
        let mut starts = Vec::with_capacity(self.num_col + 1);
        let mut indices = Vec::with_capacity(self.num_nz);
        let mut values = Vec::with_capacity(self.num_nz);
        starts.push(0);
        for (rows, factors) in self.columns.iter() {
            indices.extend_from_slice(rows);
            values.extend_from_slice(factors);
            starts.push(indices.len() as c_int);
        }
        (starts, indices, values)
    }
}

fn check(status: c_int, call: &'static str) -> Result<(), HighsError> {
    match status {
        STATUS_OK => Ok(()),
        STATUS_WARNING => {
            tracing::debug!(call, "HiGHS emitted a warning");
            Ok(())
        }
        _ => Err(HighsError::Call(call)),
    }
}

/// Owned HiGHS instance holding one minimisation program.
#[derive(Debug)]
struct Model {
    ptr: *mut c_void,
    num_col: usize,
    num_row: usize,
}

impl Drop for Model {
    fn drop(&mut self) {
        unsafe { Highs_destroy(self.ptr) }
    }
}

impl Model {
    fn load(problem: &Problem) -> Result<Self, HighsError> {
        let mut model = Self {
            ptr: unsafe { Highs_create() },
            num_col: problem.num_col,
            num_row: problem.num_row,
        };
        model.set_option("output_flag", OptionValue::Bool(false))?;
        model.set_option("log_to_console", OptionValue::Bool(false))?;
        let (starts, indices, values) = problem.compressed_columns();
        let status = unsafe {
            Highs_passLp(
                model.ptr,
                HighsInt::try_from(problem.num_col)?,
                HighsInt::try_from(problem.num_row)?,
                HighsInt::try_from(problem.num_nz)?,
                MATRIX_FORMAT_COLUMN_WISE,
                OBJECTIVE_SENSE_MINIMIZE,
                problem.offset,
                problem.col_cost.as_ptr(),
                problem.col_lower.as_ptr(),
                problem.col_upper.as_ptr(),
                problem.row_lower.as_ptr(),
                problem.row_upper.as_ptr(),
                starts.as_ptr(),
                indices.as_ptr(),
                values.as_ptr(),
            )
        };
        check(status, "Highs_passLp")?;
        Ok(model)
    }

    fn set_option(
        &mut self,
        name: &'static str,
        value: OptionValue,
    ) -> Result<(), HighsError> {
        let option =
            CString::new(name).map_err(|_| HighsError::Option(name))?;
        let key = option.as_ptr();
        let status = unsafe {
            match value {
                OptionValue::Bool(v) => {
                    Highs_setBoolOptionValue(self.ptr, key, v as c_int)
                }
                OptionValue::Int(v) => {
                    Highs_setIntOptionValue(self.ptr, key, v)
                }
                OptionValue::Float(v) => {
                    Highs_setDoubleOptionValue(self.ptr, key, v)
                }
                OptionValue::Text(v) => {
                    let text =
                        CString::new(v).map_err(|_| HighsError::Option(name))?;
                    Highs_setStringOptionValue(self.ptr, key, text.as_ptr())
                }
            }
        };
        check(status, name).map_err(|_| HighsError::Option(name))
    }

    fn set_options(
        &mut self,
        options: &[(&'static str, OptionValue)],
    ) -> Result<(), HighsError> {
        for (name, value) in options.iter() {
            self.set_option(name, *value)?;
        }
        Ok(())
    }

    fn run(&mut self) -> Result<c_int, HighsError> {
        check(unsafe { Highs_run(self.ptr) }, "Highs_run")?;
        Ok(unsafe { Highs_getModelStatus(self.ptr) })
    }

    fn primal(&self) -> Result<Vec<f64>, HighsError> {
        let mut col_value = vec![0.0; self.num_col];
        let mut col_dual = vec![0.0; self.num_col];
        let mut row_value = vec![0.0; self.num_row];
        let mut row_dual = vec![0.0; self.num_row];
        let status = unsafe {
            Highs_getSolution(
                self.ptr,
                col_value.as_mut_ptr(),
                col_dual.as_mut_ptr(),
                row_value.as_mut_ptr(),
                row_dual.as_mut_ptr(),
            )
        };
        check(status, "Highs_getSolution")?;
        Ok(col_value)
    }

    fn objective(&self) -> f64 {
        unsafe { Highs_getObjectiveValue(self.ptr) }
    }
}

/// Terminal status of one blocking solve, as seen by the orchestrators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Failed,
}

impl SolveStatus {
    pub fn is_optimal(&self) -> bool {
        matches!(self, SolveStatus::Optimal)
    }
}

/// What the oracle hands back: the primal assignment and objective are only
/// present for optimal solves.
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    pub objective: Option<f64>,
    pub primal: Option<Vec<f64>>,
    pub retries: usize,
}

impl SolveOutcome {
    fn without_solution(status: SolveStatus, retries: usize) -> Self {
        Self {
            status,
            objective: None,
            primal: None,
            retries,
        }
    }
}

/// Black-box convex solver contract: minimise the problem and report one of
/// the three terminal statuses. Implementations must not panic.
pub trait SolverOracle {
    fn solve(&self, problem: Problem) -> SolveOutcome;
}

/// HiGHS-backed oracle. Programs reported infeasible are re-solved with
/// progressively looser settings before the status is accepted.
#[derive(Debug, Clone)]
pub struct HighsOracle {
    pub max_retries: usize,
    pub time_limit: f64,
}

impl Default for HighsOracle {
    fn default() -> Self {
        Self {
            max_retries: 4,
            time_limit: 300.0,
        }
    }
}

fn tolerances(value: f64) -> [(&'static str, OptionValue); 2] {
    [
        ("primal_feasibility_tolerance", OptionValue::Float(value)),
        ("dual_feasibility_tolerance", OptionValue::Float(value)),
    ]
}

impl HighsOracle {
    pub fn new(max_retries: usize, time_limit: f64) -> Self {
        Self {
            max_retries,
            time_limit,
        }
    }

    fn default_options(&self) -> Vec<(&'static str, OptionValue)> {
        let mut options = vec![
            ("presolve", OptionValue::Text("off")),
            ("solver", OptionValue::Text("simplex")),
            ("parallel", OptionValue::Text("off")),
            ("threads", OptionValue::Int(1)),
            ("time_limit", OptionValue::Float(self.time_limit)),
        ];
        options.extend(tolerances(1e-7));
        options
    }

    fn retry_options(&self, retry: usize) -> Vec<(&'static str, OptionValue)> {
        match retry {
            1 => tolerances(1e-6).to_vec(),
            2 => tolerances(1e-5).to_vec(),
            3 => vec![("simplex_strategy", OptionValue::Int(4))],
            4 => {
                let mut options = vec![
                    ("presolve", OptionValue::Text("on")),
                    ("solver", OptionValue::Text("ipm")),
                ];
                options.extend(tolerances(1e-7));
                options
            }
            _ => self.default_options(),
        }
    }
}

impl SolverOracle for HighsOracle {
    fn solve(&self, problem: Problem) -> SolveOutcome {
        let mut model = match Model::load(&problem) {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!("HiGHS rejected the program: {e}");
                return SolveOutcome::without_solution(SolveStatus::Failed, 0);
            }
        };
        if let Err(e) = model.set_options(&self.default_options()) {
            tracing::warn!("could not set HiGHS options: {e}");
        }

        let mut retry: usize = 0;
        loop {
            let status = match model.run() {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("{e}");
                    return SolveOutcome::without_solution(
                        SolveStatus::Failed,
                        retry,
                    );
                }
            };
            match status {
                MODEL_STATUS_OPTIMAL => {
                    return match model.primal() {
                        Ok(primal) => SolveOutcome {
                            status: SolveStatus::Optimal,
                            objective: Some(model.objective()),
                            primal: Some(primal),
                            retries: retry,
                        },
                        Err(e) => {
                            tracing::warn!("could not read solution: {e}");
                            SolveOutcome::without_solution(
                                SolveStatus::Failed,
                                retry,
                            )
                        }
                    };
                }
                MODEL_STATUS_INFEASIBLE
                | MODEL_STATUS_UNBOUNDED_OR_INFEASIBLE => {
                    if retry >= self.max_retries {
                        return SolveOutcome::without_solution(
                            SolveStatus::Infeasible,
                            retry,
                        );
                    }
                    retry += 1;
                    tracing::debug!(
                        retry,
                        "re-solving a program reported infeasible"
                    );
                    let options = self.retry_options(retry);
                    if let Err(e) = model.set_options(&options) {
                        tracing::warn!("could not set retry options: {e}");
                    }
                }
                other => {
                    tracing::warn!(
                        model_status = other,
                        "HiGHS did not reach optimality"
                    );
                    return SolveOutcome::without_solution(
                        SolveStatus::Failed,
                        retry,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_small_lp() {
        // min x + 2y  s.t. x + y >= 3, x <= 2
        let mut pb = Problem::new();
        let x = pb.add_column(1.0, 0.0..=2.0);
        let y = pb.add_column(2.0, 0.0..);
        pb.add_row(3.0, f64::INFINITY, &[(x, 1.0), (y, 1.0)]);
        let outcome = HighsOracle::default().solve(pb);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        let primal = outcome.primal.unwrap();
        assert!((primal[x] - 2.0).abs() < 1e-7);
        assert!((primal[y] - 1.0).abs() < 1e-7);
        assert!((outcome.objective.unwrap() - 4.0).abs() < 1e-7);
    }

    #[test]
    fn test_offset_is_added_to_objective() {
        let mut pb = Problem::new();
        let x = pb.add_column(1.0, 1.0..=5.0);
        pb.offset = 10.0;
        pb.add_row(f64::NEG_INFINITY, 4.0, &[(x, 1.0)]);
        let outcome = HighsOracle::default().solve(pb);
        assert!((outcome.objective.unwrap() - 11.0).abs() < 1e-7);
    }

    #[test]
    fn test_infeasible_program_is_reported_not_panicking() {
        let mut pb = Problem::new();
        let x = pb.add_column(1.0, 0.0..=1.0);
        pb.add_row(2.0, f64::INFINITY, &[(x, 1.0)]);
        let outcome = HighsOracle::new(1, 10.0).solve(pb);
        assert_eq!(outcome.status, SolveStatus::Infeasible);
        assert!(outcome.primal.is_none());
        assert_eq!(outcome.retries, 1);
    }

    #[test]
    fn test_retry_ladder_ends_on_interior_point() {
        let oracle = HighsOracle::default();
        let last = oracle.retry_options(4);
        assert!(last.contains(&("solver", OptionValue::Text("ipm"))));
        assert_eq!(oracle.retry_options(9), oracle.default_options());
    }
}
