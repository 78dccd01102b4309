//! Risk-aware DC dispatch of a meshed grid with affine reserve policies.
//!
//! Generators follow `p_g - β_g D` where `D = Σ_w (ξ_w - forecast_w)` is the
//! total wind deviation of a scenario and `Σ β_g = 1`. Line flows enter as
//! Wasserstein CVaR constraints over the wind scenarios, and every enabled
//! N-1 contingency adds hard post-outage rows on the nominal schedule.

use crate::contingency::{
    self, ContingencyAccessors, ContingencyReport, ContingencySettings,
    FlowMappingCache, LineOutageTable,
};
use crate::grid::{self, FlowMapping, Grid, GridError};
use crate::log;
use crate::output::{ArchivedRecord, ResultStore, ScheduleEntry};
use crate::program::{LinExpr, Program};
use crate::recovery::{self, BusInjections, DcFlow, VerificationSummary};
use crate::risk::{
    self, ConstraintKind, CvarBreakdown, RiskAccessors, RiskConstraint,
    RiskError, RiskParams, TransportNorm,
};
use crate::scenario::ScenarioSet;
use crate::solver::{SolveOutcome, SolveStatus, SolverOracle};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error(
        "scenario set has {found} resources, the grid has {expected} wind farms"
    )]
    ScenarioShape { expected: usize, found: usize },
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error(transparent)]
    Grid(#[from] GridError),
}

#[derive(Debug, Clone)]
pub struct TransmissionSettings {
    pub alpha: f64,
    pub norm: TransportNorm,
    pub contingencies: ContingencySettings,
}

impl Default for TransmissionSettings {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            norm: TransportNorm::L1,
            contingencies: ContingencySettings::default(),
        }
    }
}

/// Data of one point of the radius × risk-weight sweep.
#[derive(Debug, Clone)]
pub struct StageInputs<'a> {
    /// Wind realizations, single offset, one resource per wind farm
    pub scenarios: &'a ScenarioSet,
    pub params: RiskParams,
}

#[derive(Debug, Clone, Default)]
pub struct Accessors {
    pub generation: Vec<usize>,
    pub participation: Vec<usize>,
    pub balance: usize,
    pub risk: Vec<RiskAccessors>,
    pub contingencies: Vec<ContingencyAccessors>,
}

fn total_deviation(scenarios: &ScenarioSet, scenario: usize) -> f64 {
    (0..scenarios.num_resources)
        .map(|w| scenarios.deviation(scenario, 0, w))
        .sum()
}

/// Scenario bus injections `Σ (p_g - β_g D) + Σ ξ_w - L_n`.
fn scenario_injections(
    grid: &Grid,
    accessors: &Accessors,
    scenarios: &ScenarioSet,
    scenario: usize,
) -> Vec<LinExpr> {
    let deviation = total_deviation(scenarios, scenario);
    let mut injections: Vec<LinExpr> = (0..grid.num_buses)
        .map(|bus| LinExpr::constant(-grid.bus_demand(bus)))
        .collect();
    for (g, generator) in grid.generators.iter().enumerate() {
        injections[generator.bus_id]
            .add_term(accessors.generation[g], 1.0)
            .add_term(accessors.participation[g], -deviation);
    }
    for (w, farm) in grid.wind_farms.iter().enumerate() {
        let realized = scenarios.realized(scenario, 0, w);
        injections[farm.bus_id].add_constant(realized);
    }
    injections
}

fn line_flow_constraints(
    grid: &Grid,
    base: &FlowMapping,
    accessors: &Accessors,
    scenarios: &ScenarioSet,
) -> Vec<RiskConstraint> {
    let injections: Vec<Vec<LinExpr>> = (0..scenarios.num_scenarios)
        .map(|s| scenario_injections(grid, accessors, scenarios, s))
        .collect();
    let mut constraints = Vec::<RiskConstraint>::new();
    for row in 0..base.num_lines() {
        let limit = base.limits[row];
        let flows: Vec<LinExpr> = injections
            .iter()
            .map(|bus_injections| {
                let mut flow = LinExpr::new();
                for (bus, injection) in bus_injections.iter().enumerate() {
                    flow.add_scaled(injection, base.factor(row, bus));
                }
                flow
            })
            .collect();
        // ∂f/∂ξ_w = PTDF[l][bus(w)] - Σ_g PTDF[l][bus(g)] β_g
        let gradient: Vec<LinExpr> = grid
            .wind_farms
            .iter()
            .map(|farm| {
                let mut d = LinExpr::constant(base.factor(row, farm.bus_id));
                for (g, generator) in grid.generators.iter().enumerate() {
                    d.add_term(
                        accessors.participation[g],
                        -base.factor(row, generator.bus_id),
                    );
                }
                d
            })
            .collect();
        for (direction, sign) in [("fwd", 1.0), ("rev", -1.0)] {
            constraints.push(RiskConstraint {
                label: format!("flow_{direction}[l{}]", base.line_ids[row]),
                kind: ConstraintKind::LineFlow,
                violations: flows
                    .iter()
                    .map(|f| {
                        let mut g = f.scaled(sign);
                        g.add_constant(-limit);
                        g
                    })
                    .collect(),
                gradient: gradient.iter().map(|d| d.scaled(sign)).collect(),
            });
        }
    }
    constraints
}

/// Builds the program of one sweep point.
pub fn build_stage(
    grid: &Grid,
    settings: &TransmissionSettings,
    table: &LineOutageTable,
    base: &FlowMapping,
    cache: &mut FlowMappingCache,
    inputs: &StageInputs,
) -> Result<(Program, Accessors), TransmissionError> {
    let scenarios = inputs.scenarios;
    if scenarios.num_resources != grid.wind_farms.len() {
        return Err(TransmissionError::ScenarioShape {
            expected: grid.wind_farms.len(),
            found: scenarios.num_resources,
        });
    }
    let mut program = Program::new();
    let mut accessors = Accessors::default();

    let mean_deviation = (0..scenarios.num_scenarios)
        .map(|s| total_deviation(scenarios, s))
        .sum::<f64>()
        / scenarios.num_scenarios.max(1) as f64;
    for generator in grid.generators.iter() {
        accessors.generation.push(program.add_column(
            generator.cost,
            generator.min_output..=generator.max_output,
        ));
        let cost = -generator.cost * mean_deviation;
        accessors
            .participation
            .push(program.add_column(cost, 0.0..=1.0));
    }

    let mut participation_sum = LinExpr::new();
    let mut balance = LinExpr::new();
    for g in 0..grid.generators.len() {
        participation_sum.add_term(accessors.participation[g], 1.0);
        balance.add_term(accessors.generation[g], 1.0);
    }
    program.add_eq(&participation_sum, 1.0);
    let forecast: f64 = (0..scenarios.num_resources)
        .map(|w| scenarios.forecast(0, w))
        .sum();
    accessors.balance =
        program.add_eq(&balance, grid.total_demand() - forecast);

    let constraints = line_flow_constraints(grid, base, &accessors, scenarios);
    for constraint in constraints.iter() {
        let risk_accessors = risk::add_risk_constraint(
            &mut program,
            constraint,
            &inputs.params,
        )?;
        accessors.risk.push(risk_accessors);
    }

    let contingencies =
        contingency::enumerate(grid, &settings.contingencies, table);
    for c in contingencies.iter() {
        let contingency_accessors = contingency::add_contingency(
            &mut program,
            grid,
            c,
            &accessors.generation,
            base,
            cache,
            &settings.contingencies,
        )?;
        accessors.contingencies.push(contingency_accessors);
    }
    Ok((program, accessors))
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub status: SolveStatus,
    pub retries: usize,
    pub objective: Option<f64>,
    pub operating_cost: Option<f64>,
    pub cvar: Vec<CvarBreakdown>,
    pub generation: Option<Vec<f64>>,
    pub participation: Option<Vec<f64>>,
    pub contingencies: Vec<ContingencyReport>,
}

impl StageResult {
    fn from_outcome(
        outcome: SolveOutcome,
        accessors: &Accessors,
        params: &RiskParams,
    ) -> Self {
        let (Some(primal), Some(objective), true) = (
            outcome.primal.as_ref(),
            outcome.objective,
            outcome.status.is_optimal(),
        ) else {
            return Self {
                status: outcome.status,
                retries: outcome.retries,
                objective: None,
                operating_cost: None,
                cvar: vec![],
                generation: None,
                participation: None,
                contingencies: vec![],
            };
        };
        let cvar: Vec<CvarBreakdown> = accessors
            .risk
            .iter()
            .map(|r| r.breakdown(primal, params))
            .collect();
        let risk_term: f64 = cvar.iter().map(|c| c.contribution).sum();
        let values = |cols: &[usize]| -> Vec<f64> {
            cols.iter().map(|c| primal[*c]).collect()
        };
        Self {
            status: outcome.status,
            retries: outcome.retries,
            objective: Some(objective),
            operating_cost: Some(objective - risk_term),
            cvar,
            generation: Some(values(&accessors.generation)),
            participation: Some(values(&accessors.participation)),
            contingencies: accessors
                .contingencies
                .iter()
                .map(|c| c.report(primal))
                .collect(),
        }
    }

    pub fn total_cvar(&self) -> f64 {
        self.cvar.iter().map(|c| c.cvar).sum()
    }

    fn schedule(&self) -> Vec<ScheduleEntry> {
        let mut schedule = Vec::<ScheduleEntry>::new();
        for (name, values) in [
            ("generation", &self.generation),
            ("participation", &self.participation),
        ] {
            for (g, value) in values.iter().flatten().enumerate() {
                let entity = format!("{name}[{g}]");
                schedule.push(ScheduleEntry::new(entity, *value));
            }
        }
        schedule
    }
}

/// Builds and solves one sweep point.
pub fn solve_stage<O: SolverOracle + ?Sized>(
    grid: &Grid,
    settings: &TransmissionSettings,
    table: &LineOutageTable,
    base: &FlowMapping,
    cache: &mut FlowMappingCache,
    inputs: &StageInputs,
    oracle: &O,
) -> Result<StageResult, TransmissionError> {
    let (program, accessors) =
        build_stage(grid, settings, table, base, cache, inputs)?;
    let outcome = program.solve(oracle);
    Ok(StageResult::from_outcome(outcome, &accessors, &inputs.params))
}

/// Line flows of the reserve policy under unseen wind realizations.
pub fn verify_stage(
    grid: &Grid,
    base: &FlowMapping,
    generation: &[f64],
    participation: &[f64],
    holdout: &ScenarioSet,
    alpha: f64,
) -> VerificationSummary {
    let samples: Vec<BusInjections> = (0..holdout.num_scenarios)
        .map(|s| {
            let deviation = total_deviation(holdout, s);
            let mut injections = BusInjections::zeros(grid.num_buses);
            for d in grid.loads.iter() {
                injections.active[d.bus_id] -= d.demand;
            }
            for (g, generator) in grid.generators.iter().enumerate() {
                injections.active[generator.bus_id] +=
                    generation[g] - participation[g] * deviation;
            }
            for (w, farm) in grid.wind_farms.iter().enumerate() {
                injections.active[farm.bus_id] += holdout.realized(s, 0, w);
            }
            injections
        })
        .collect();
    let lower: Vec<f64> = base.limits.iter().map(|l| -l).collect();
    recovery::monte_carlo(
        &DcFlow::new(base),
        &samples,
        &lower,
        &base.limits,
        alpha,
    )
}

#[derive(Debug, Clone)]
pub struct TransmissionCase<'a> {
    pub grid: &'a Grid,
    pub settings: &'a TransmissionSettings,
    pub table: &'a LineOutageTable,
    pub samples: &'a ScenarioSet,
    pub holdout: Option<&'a ScenarioSet>,
}

/// Sequential sweep over radii and risk weights. Records are keyed by
/// `(risk index, radius index)`.
pub fn run_sweep<O: SolverOracle + ?Sized>(
    case: &TransmissionCase,
    epsilons: &[f64],
    risk_weights: &[f64],
    oracle: &O,
    store: &mut ResultStore,
) -> Result<(), TransmissionError> {
    let grid = case.grid;
    let base = grid::flow_mapping(grid, &grid.all_lines())?;
    let mut cache = FlowMappingCache::new();
    log::sweep_greeting(
        epsilons.len(),
        risk_weights.len(),
        case.samples.num_scenarios,
    );
    log::sweep_table_header("radius");
    log::sweep_table_divider();
    for (radius_index, epsilon) in epsilons.iter().enumerate() {
        for (risk_index, rho) in risk_weights.iter().enumerate() {
            let begin = Instant::now();
            let params = RiskParams::new(
                *rho,
                *epsilon,
                case.settings.alpha,
                case.settings.norm,
            )?;
            let inputs = StageInputs {
                scenarios: case.samples,
                params,
            };
            let result = solve_stage(
                grid,
                case.settings,
                case.table,
                &base,
                &mut cache,
                &inputs,
                oracle,
            )?;
            if !result.status.is_optimal() {
                tracing::warn!(
                    epsilon,
                    risk_weight = rho,
                    status = ?result.status,
                    "sweep point not solved to optimality"
                );
            }
            let verification = match (
                case.holdout,
                result.generation.as_ref(),
                result.participation.as_ref(),
            ) {
                (Some(holdout), Some(generation), Some(participation)) => Some(
                    verify_stage(
                        grid,
                        &base,
                        generation,
                        participation,
                        holdout,
                        case.settings.alpha,
                    ),
                ),
                _ => None,
            };
            log::sweep_table_row(
                *rho,
                radius_index,
                &result.status,
                result.objective,
                result.total_cvar(),
                begin.elapsed(),
            );
            let mut record = ArchivedRecord::flagged(
                risk_index,
                radius_index,
                *rho,
                *epsilon,
                result.status,
                result.retries,
            );
            record.objective = result.objective;
            record.operating_cost = result.operating_cost;
            record.schedule = result.schedule();
            record.cvar = result.cvar;
            record.contingencies = result.contingencies;
            record.verification = verification;
            if !store.push(record) {
                tracing::warn!(
                    risk_index,
                    radius_index,
                    "result key already archived, record dropped"
                );
            }
        }
    }
    tracing::debug!(mappings = cache.builds(), "line outage mappings built");
    Ok(())
}
