//! Receding-horizon scheduling of a radial feeder with PV curtailment,
//! inverter reactive power and batteries.
//!
//! Each epoch solves one program over the look-ahead window. Voltage and
//! inverter apparent-power limits enter as Wasserstein CVaR constraints over
//! the PV realization scenarios of every offset. The first-offset battery
//! state of charge of an optimal solve becomes the initial condition of the
//! next epoch.

use crate::feeder::Feeder;
use crate::log;
use crate::output::{ArchivedRecord, ResultStore, ScheduleEntry};
use crate::program::{LinExpr, Program};
use crate::recovery::{self, BusInjections, DistFlowSweep, VerificationSummary};
use crate::risk::{
    self, ConstraintKind, CvarBreakdown, RiskAccessors, RiskConstraint,
    RiskError, RiskParams, TransportNorm,
};
use crate::scenario::{ErrorDataset, ForecastSeries, ScenarioError, ScenarioSet};
use crate::schedule::ActivationSchedule;
use crate::solver::{SolveOutcome, SolveStatus, SolverOracle};
use crate::state::StorageState;
use crate::utils::hold_last;
use std::f64::consts::{FRAC_PI_2, PI};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("the look-ahead horizon must have at least one offset")]
    EmptyHorizon,
    #[error("expected {expected} initial SOC values, got {found}")]
    SocDimension { expected: usize, found: usize },
    #[error(
        "scenario set has {offsets} offsets and {resources} resources, \
         the feeder needs {horizon} offsets and {pvs} resources"
    )]
    ScenarioShape {
        offsets: usize,
        resources: usize,
        horizon: usize,
        pvs: usize,
    },
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}

#[derive(Debug, Clone)]
pub struct DistributionSettings {
    pub horizon: usize,
    /// Length of one offset in hours
    pub step_hours: f64,
    pub alpha: f64,
    pub epsilon: f64,
    pub norm: TransportNorm,
    /// Facets of the polygon approximating the inverter capability circle
    pub apparent_power_facets: usize,
    pub curtailment_penalty: f64,
    pub degradation_cost: f64,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            horizon: 4,
            step_hours: 0.25,
            alpha: 0.05,
            epsilon: 0.0,
            norm: TransportNorm::L1,
            apparent_power_facets: 4,
            curtailment_penalty: 0.0,
            degradation_cost: 0.001,
        }
    }
}

/// Data of one decision epoch.
#[derive(Debug, Clone)]
pub struct EpochInputs<'a> {
    pub epoch: usize,
    pub scenarios: &'a ScenarioSet,
    /// Energy price per time step, the last value held past the end
    pub prices: &'a [f64],
    pub initial_soc: &'a [f64],
    pub params: RiskParams,
}

/// Columns and rows of one epoch program, indexed `[offset][device]`.
#[derive(Debug, Clone, Default)]
pub struct Accessors {
    pub curtailment: Vec<Vec<usize>>,
    pub reactive_power: Vec<Vec<usize>>,
    pub charge: Vec<Vec<usize>>,
    pub discharge: Vec<Vec<usize>>,
    pub soc: Vec<Vec<usize>>,
    pub soc_dynamics: Vec<usize>,
    pub risk: Vec<RiskAccessors>,
}

fn facet_angle(facet: usize, num_facets: usize) -> f64 {
    if num_facets <= 1 {
        return 0.0;
    }
    -FRAC_PI_2 + PI * facet as f64 / (num_facets - 1) as f64
}

fn snap(value: f64) -> f64 {
    if value.abs() < 1e-12 {
        0.0
    } else {
        value
    }
}

fn add_device_columns(
    program: &mut Program,
    feeder: &Feeder,
    horizon: usize,
    initial_soc: &[f64],
) -> Accessors {
    let mut accessors = Accessors::default();
    for _ in 0..horizon {
        accessors.curtailment.push(
            feeder
                .pvs
                .iter()
                .map(|_| program.add_column(0.0, 0.0..=1.0))
                .collect(),
        );
        accessors.reactive_power.push(
            feeder
                .pvs
                .iter()
                .map(|pv| {
                    program.add_column(
                        0.0,
                        -pv.apparent_rating..=pv.apparent_rating,
                    )
                })
                .collect(),
        );
        let mut charge = Vec::<usize>::new();
        let mut discharge = Vec::<usize>::new();
        let mut soc = Vec::<usize>::new();
        for (b, battery) in feeder.batteries.iter().enumerate() {
            if horizon == 1 {
                // no charge/discharge freedom, SOC stays at the carried value
                charge.push(program.add_column(0.0, 0.0..=0.0));
                discharge.push(program.add_column(0.0, 0.0..=0.0));
                let carried = initial_soc[b];
                soc.push(program.add_column(0.0, carried..=carried));
            } else {
                let power = 0.0..=battery.max_power;
                charge.push(program.add_column(0.0, power.clone()));
                discharge.push(program.add_column(0.0, power));
                soc.push(
                    program.add_column(0.0, battery.min_soc..=battery.max_soc),
                );
            }
        }
        accessors.charge.push(charge);
        accessors.discharge.push(discharge);
        accessors.soc.push(soc);
    }
    accessors
}

fn add_soc_dynamics(
    program: &mut Program,
    accessors: &mut Accessors,
    feeder: &Feeder,
    settings: &DistributionSettings,
    initial_soc: &[f64],
) {
    if settings.horizon == 1 {
        return;
    }
    let dt = settings.step_hours;
    for h in 0..settings.horizon {
        for (b, battery) in feeder.batteries.iter().enumerate() {
            let mut row = LinExpr::term(accessors.soc[h][b], 1.0);
            if h == 0 {
                row.add_constant(-initial_soc[b]);
            } else {
                row.add_term(accessors.soc[h - 1][b], -1.0);
            }
            row.add_term(
                accessors.charge[h][b],
                -battery.charge_efficiency * dt,
            )
            .add_term(
                accessors.discharge[h][b],
                dt / battery.discharge_efficiency,
            );
            let id = program.add_eq(&row, 0.0);
            accessors.soc_dynamics.push(id);
        }
    }
}

fn add_operating_cost(
    program: &mut Program,
    accessors: &Accessors,
    feeder: &Feeder,
    settings: &DistributionSettings,
    inputs: &EpochInputs,
) {
    let dt = settings.step_hours;
    let mut cost = LinExpr::new();
    for h in 0..settings.horizon {
        let time = inputs.epoch + h;
        let price = hold_last(inputs.prices, time);
        let load: f64 =
            feeder.buses.iter().map(|b| b.active_load_at(time)).sum();
        cost.add_constant(dt * price * load);
        for (k, c) in accessors.curtailment[h].iter().enumerate() {
            let mean = inputs.scenarios.mean(h, k);
            cost.add_constant(-dt * price * mean);
            let penalty = price + settings.curtailment_penalty;
            cost.add_term(*c, dt * penalty * mean);
        }
        for b in 0..feeder.batteries.len() {
            cost.add_term(
                accessors.charge[h][b],
                dt * (price + settings.degradation_cost),
            );
            cost.add_term(
                accessors.discharge[h][b],
                dt * (settings.degradation_cost - price),
            );
        }
    }
    program.add_objective(&cost);
}

/// Net bus injections `(p, q)` at offset `h` under scenario `s`.
fn bus_injections(
    feeder: &Feeder,
    accessors: &Accessors,
    scenarios: &ScenarioSet,
    time: usize,
    h: usize,
    s: usize,
) -> (Vec<LinExpr>, Vec<LinExpr>) {
    let mut p: Vec<LinExpr> = feeder
        .buses
        .iter()
        .map(|b| LinExpr::constant(-b.active_load_at(time)))
        .collect();
    let mut q: Vec<LinExpr> = feeder
        .buses
        .iter()
        .map(|b| LinExpr::constant(-b.reactive_load_at(time)))
        .collect();
    for (k, pv) in feeder.pvs.iter().enumerate() {
        let available = scenarios.realized(s, h, k);
        p[pv.bus_id]
            .add_constant(available)
            .add_term(accessors.curtailment[h][k], -available);
        q[pv.bus_id].add_term(accessors.reactive_power[h][k], 1.0);
    }
    for (b, battery) in feeder.batteries.iter().enumerate() {
        p[battery.bus_id]
            .add_term(accessors.discharge[h][b], 1.0)
            .add_term(accessors.charge[h][b], -1.0);
    }
    (p, q)
}

fn squared_voltage(
    feeder: &Feeder,
    bus: usize,
    p: &[LinExpr],
    q: &[LinExpr],
) -> LinExpr {
    let mut v = LinExpr::constant(feeder.substation_voltage.powi(2));
    for m in 0..feeder.num_buses() {
        v.add_scaled(&p[m], 2.0 * feeder.resistance_sensitivity(bus, m));
        v.add_scaled(&q[m], 2.0 * feeder.reactance_sensitivity(bus, m));
    }
    v
}

fn voltage_constraints(
    feeder: &Feeder,
    accessors: &Accessors,
    inputs: &EpochInputs,
    h: usize,
    kind: ConstraintKind,
) -> Vec<RiskConstraint> {
    let time = inputs.epoch + h;
    let scenarios = inputs.scenarios;
    let sign = match kind {
        ConstraintKind::VoltageLower => -1.0,
        _ => 1.0,
    };
    let injections: Vec<(Vec<LinExpr>, Vec<LinExpr>)> = (0..scenarios
        .num_scenarios)
        .map(|s| bus_injections(feeder, accessors, scenarios, time, h, s))
        .collect();
    let mut constraints = Vec::<RiskConstraint>::new();
    for bus in 1..feeder.num_buses() {
        let violations = injections
            .iter()
            .map(|(p, q)| {
                let v = squared_voltage(feeder, bus, p, q);
                let mut g = v.scaled(sign);
                match kind {
                    ConstraintKind::VoltageLower => {
                        g.add_constant(feeder.min_voltage.powi(2))
                    }
                    _ => g.add_constant(-feeder.max_voltage.powi(2)),
                };
                g
            })
            .collect();
        // ∂v_j/∂P_k = 2 R_{j, bus(k)} (1 - c_k)
        let gradient = feeder
            .pvs
            .iter()
            .enumerate()
            .map(|(k, pv)| {
                let r = 2.0
                    * sign
                    * feeder.resistance_sensitivity(bus, pv.bus_id);
                let mut d = LinExpr::constant(r);
                d.add_term(accessors.curtailment[h][k], -r);
                d
            })
            .collect();
        let name = match kind {
            ConstraintKind::VoltageLower => "v_lower",
            _ => "v_upper",
        };
        constraints.push(RiskConstraint {
            label: format!("{name}[b{bus},h{h}]"),
            kind,
            violations,
            gradient,
        });
    }
    constraints
}

fn apparent_power_constraints(
    feeder: &Feeder,
    settings: &DistributionSettings,
    accessors: &Accessors,
    scenarios: &ScenarioSet,
    h: usize,
) -> Vec<RiskConstraint> {
    let num_facets = settings.apparent_power_facets.max(1);
    let mut constraints = Vec::<RiskConstraint>::new();
    for (k, pv) in feeder.pvs.iter().enumerate() {
        let c = accessors.curtailment[h][k];
        let q = accessors.reactive_power[h][k];
        for f in 0..num_facets {
            let angle = facet_angle(f, num_facets);
            let (cos, sin) = (snap(angle.cos()), snap(angle.sin()));
            let violations = (0..scenarios.num_scenarios)
                .map(|s| {
                    let available = scenarios.realized(s, h, k);
                    let mut g = LinExpr::constant(
                        cos * available - pv.apparent_rating,
                    );
                    g.add_term(c, -cos * available).add_term(q, sin);
                    g
                })
                .collect();
            let gradient = (0..feeder.pvs.len())
                .map(|other| {
                    if other != k {
                        return LinExpr::new();
                    }
                    let mut d = LinExpr::constant(cos);
                    d.add_term(c, -cos);
                    d
                })
                .collect();
            constraints.push(RiskConstraint {
                label: format!("apparent[pv{k},h{h},f{f}]"),
                kind: ConstraintKind::ApparentPower,
                violations,
                gradient,
            });
        }
    }
    constraints
}

/// Builds the program of one epoch.
pub fn build_epoch(
    feeder: &Feeder,
    settings: &DistributionSettings,
    schedule: &ActivationSchedule,
    inputs: &EpochInputs,
) -> Result<(Program, Accessors), DistributionError> {
    let horizon = settings.horizon;
    if horizon == 0 {
        return Err(DistributionError::EmptyHorizon);
    }
    if inputs.initial_soc.len() != feeder.batteries.len() {
        return Err(DistributionError::SocDimension {
            expected: feeder.batteries.len(),
            found: inputs.initial_soc.len(),
        });
    }
    let scenarios = inputs.scenarios;
    if scenarios.horizon < horizon
        || scenarios.num_resources != feeder.pvs.len()
    {
        return Err(DistributionError::ScenarioShape {
            offsets: scenarios.horizon,
            resources: scenarios.num_resources,
            horizon,
            pvs: feeder.pvs.len(),
        });
    }

    let mut program = Program::new();
    let mut accessors =
        add_device_columns(&mut program, feeder, horizon, inputs.initial_soc);
    add_soc_dynamics(
        &mut program,
        &mut accessors,
        feeder,
        settings,
        inputs.initial_soc,
    );
    add_operating_cost(&mut program, &accessors, feeder, settings, inputs);

    for h in 0..horizon {
        let active = schedule.active_kinds(inputs.epoch + h);
        let mut constraints = Vec::<RiskConstraint>::new();
        for kind in active.iter() {
            match kind {
                ConstraintKind::VoltageUpper | ConstraintKind::VoltageLower => {
                    constraints.extend(voltage_constraints(
                        feeder, &accessors, inputs, h, *kind,
                    ))
                }
                ConstraintKind::ApparentPower => {
                    constraints.extend(apparent_power_constraints(
                        feeder, settings, &accessors, scenarios, h,
                    ))
                }
                ConstraintKind::LineFlow => {}
            }
        }
        for constraint in constraints.iter() {
            let risk_accessors = risk::add_risk_constraint(
                &mut program,
                constraint,
                &inputs.params,
            )?;
            accessors.risk.push(risk_accessors);
        }
    }
    Ok((program, accessors))
}

/// First-offset decisions, the ones applied before the next epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstOffset {
    pub curtailment: Vec<f64>,
    pub reactive_power: Vec<f64>,
    /// Discharge minus charge per battery
    pub battery_power: Vec<f64>,
    pub soc: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct EpochResult {
    pub status: SolveStatus,
    pub retries: usize,
    pub objective: Option<f64>,
    pub operating_cost: Option<f64>,
    pub cvar: Vec<CvarBreakdown>,
    pub schedule: Vec<ScheduleEntry>,
    pub first_offset: Option<FirstOffset>,
}

impl EpochResult {
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
                schedule: vec![],
                first_offset: None,
            };
        };
        let cvar: Vec<CvarBreakdown> = accessors
            .risk
            .iter()
            .map(|r| r.breakdown(primal, params))
            .collect();
        let risk_term: f64 = cvar.iter().map(|c| c.contribution).sum();

        let mut schedule = Vec::<ScheduleEntry>::new();
        for h in 0..accessors.curtailment.len() {
            let mut push = |name: &str, cols: &[usize]| {
                for (i, col) in cols.iter().enumerate() {
                    schedule.push(ScheduleEntry::new(
                        format!("{name}[{i},h{h}]"),
                        primal[*col],
                    ));
                }
            };
            push("curtailment", &accessors.curtailment[h]);
            push("reactive_power", &accessors.reactive_power[h]);
            push("charge", &accessors.charge[h]);
            push("discharge", &accessors.discharge[h]);
            push("soc", &accessors.soc[h]);
        }

        let values = |cols: &[usize]| -> Vec<f64> {
            cols.iter().map(|c| primal[*c]).collect()
        };
        let first_offset = FirstOffset {
            curtailment: values(&accessors.curtailment[0]),
            reactive_power: values(&accessors.reactive_power[0]),
            battery_power: accessors.discharge[0]
                .iter()
                .zip(accessors.charge[0].iter())
                .map(|(d, c)| primal[*d] - primal[*c])
                .collect(),
            soc: values(&accessors.soc[0]),
        };

        Self {
            status: outcome.status,
            retries: outcome.retries,
            objective: Some(objective),
            operating_cost: Some(objective - risk_term),
            cvar,
            schedule,
            first_offset: Some(first_offset),
        }
    }

    pub fn total_cvar(&self) -> f64 {
        self.cvar.iter().map(|c| c.cvar).sum()
    }

    fn into_record(
        self,
        risk_index: usize,
        epoch: usize,
        params: &RiskParams,
        verification: Option<VerificationSummary>,
    ) -> ArchivedRecord {
        let mut record = ArchivedRecord::flagged(
            risk_index,
            epoch,
            params.rho,
            params.epsilon,
            self.status,
            self.retries,
        );
        record.objective = self.objective;
        record.operating_cost = self.operating_cost;
        record.cvar = self.cvar;
        record.schedule = self.schedule;
        record.verification = verification;
        record
    }
}

/// Builds and solves one epoch.
pub fn solve_epoch<O: SolverOracle + ?Sized>(
    feeder: &Feeder,
    settings: &DistributionSettings,
    schedule: &ActivationSchedule,
    inputs: &EpochInputs,
    oracle: &O,
) -> Result<EpochResult, DistributionError> {
    let (program, accessors) = build_epoch(feeder, settings, schedule, inputs)?;
    let outcome = program.solve(oracle);
    Ok(EpochResult::from_outcome(outcome, &accessors, &inputs.params))
}

/// Recovers the feeder voltages of the first-offset decisions under every
/// hold-out realization and checks them against the voltage limits.
pub fn verify_first_offset(
    feeder: &Feeder,
    decisions: &FirstOffset,
    holdout: &ScenarioSet,
    time: usize,
    alpha: f64,
) -> VerificationSummary {
    let samples: Vec<BusInjections> = (0..holdout.num_scenarios)
        .map(|s| {
            let mut injections = BusInjections {
                active: feeder
                    .buses
                    .iter()
                    .map(|b| -b.active_load_at(time))
                    .collect(),
                reactive: feeder
                    .buses
                    .iter()
                    .map(|b| -b.reactive_load_at(time))
                    .collect(),
            };
            for (k, pv) in feeder.pvs.iter().enumerate() {
                let delivered = 1.0 - decisions.curtailment[k];
                injections.active[pv.bus_id] +=
                    delivered * holdout.realized(s, 0, k);
                injections.reactive[pv.bus_id] += decisions.reactive_power[k];
            }
            for (b, battery) in feeder.batteries.iter().enumerate() {
                injections.active[battery.bus_id] += decisions.battery_power[b];
            }
            injections
        })
        .collect();
    let n = feeder.num_buses();
    recovery::monte_carlo(
        &DistFlowSweep::new(feeder),
        &samples,
        &vec![feeder.min_voltage; n],
        &vec![feeder.max_voltage; n],
        alpha,
    )
}

/// Everything the MPC sweep needs besides the risk weights.
#[derive(Debug, Clone)]
pub struct DistributionCase<'a> {
    pub feeder: &'a Feeder,
    pub settings: &'a DistributionSettings,
    pub schedule: &'a ActivationSchedule,
    pub forecast: &'a ForecastSeries,
    pub prices: &'a [f64],
    pub errors: &'a ErrorDataset,
    pub num_scenarios: usize,
    pub num_holdout: usize,
    pub initial_soc: &'a [f64],
}

/// Sequential sweep over risk weights and epochs. Every epoch is archived,
/// whatever its status. The carried SOC only advances after optimal solves.
pub fn run_mpc<O: SolverOracle + ?Sized>(
    case: &DistributionCase,
    risk_weights: &[f64],
    num_epochs: usize,
    oracle: &O,
    store: &mut ResultStore,
) -> Result<(), DistributionError> {
    let settings = case.settings;
    let capacities: Vec<f64> =
        case.feeder.pvs.iter().map(|pv| pv.capacity).collect();
    let holdout_range =
        case.num_scenarios..case.num_scenarios + case.num_holdout;
    log::mpc_greeting(risk_weights.len(), num_epochs, settings.horizon);
    log::sweep_table_header("epoch");
    log::sweep_table_divider();
    for (risk_index, rho) in risk_weights.iter().enumerate() {
        let params = RiskParams::new(
            *rho,
            settings.epsilon,
            settings.alpha,
            settings.norm,
        )?;
        let mut state = StorageState::new(case.initial_soc.to_vec());
        for epoch in 0..num_epochs {
            let begin = Instant::now();
            let scenarios = ScenarioSet::build(
                case.errors,
                case.forecast,
                &capacities,
                epoch,
                settings.horizon,
                0..case.num_scenarios,
            )?;
            let initial_soc = state.shared_initial_soc();
            let inputs = EpochInputs {
                epoch,
                scenarios: &scenarios,
                prices: case.prices,
                initial_soc: initial_soc.as_slice(),
                params,
            };
            let result = solve_epoch(
                case.feeder,
                settings,
                case.schedule,
                &inputs,
                oracle,
            )?;

            let verification = match &result.first_offset {
                Some(decisions) if case.num_holdout > 0 => {
                    let holdout = ScenarioSet::build(
                        case.errors,
                        case.forecast,
                        &capacities,
                        epoch,
                        1,
                        holdout_range.clone(),
                    )?;
                    Some(verify_first_offset(
                        case.feeder,
                        decisions,
                        &holdout,
                        epoch,
                        settings.alpha,
                    ))
                }
                _ => None,
            };

            match (&result.status, &result.first_offset) {
                (SolveStatus::Optimal, Some(decisions)) => {
                    state.update_with_first_offset(decisions.soc.clone());
                }
                (status, _) => tracing::warn!(
                    epoch,
                    risk_weight = rho,
                    ?status,
                    "epoch not solved to optimality, keeping the carried SOC"
                ),
            }

            log::sweep_table_row(
                *rho,
                epoch,
                &result.status,
                result.objective,
                result.total_cvar(),
                begin.elapsed(),
            );
            let record =
                result.into_record(risk_index, epoch, &params, verification);
            if !store.push(record) {
                tracing::warn!(
                    risk_index,
                    epoch,
                    "result key already archived, record dropped"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::tests::small_feeder;
    use crate::schedule::{ActivationRule, TimeWindow};
    use crate::solver::HighsOracle;
    use chrono::NaiveTime;

    fn errors(num_scenarios: usize) -> ErrorDataset {
        ErrorDataset::synthetic(6, 4, num_scenarios, &[0.15], 11).unwrap()
    }

    fn forecast() -> ForecastSeries {
        ForecastSeries::new(vec![vec![0.5]; 8])
    }

    fn settings(horizon: usize) -> DistributionSettings {
        DistributionSettings {
            horizon,
            step_hours: 0.25,
            alpha: 0.1,
            epsilon: 0.01,
            ..Default::default()
        }
    }

    fn voltage_schedule() -> ActivationSchedule {
        ActivationSchedule::always(&[
            ConstraintKind::VoltageUpper,
            ConstraintKind::VoltageLower,
            ConstraintKind::ApparentPower,
        ])
    }

    /// Feeder whose PV pushes bus 2 above the upper voltage limit unless it
    /// is curtailed or absorbs reactive power.
    fn tight_feeder() -> Feeder {
        let mut feeder = small_feeder();
        feeder.max_voltage = 1.005;
        feeder
    }

    fn solve(
        feeder: &Feeder,
        settings: &DistributionSettings,
        scenarios: &ScenarioSet,
        rho: f64,
        initial_soc: &[f64],
    ) -> (EpochResult, Accessors) {
        let params = RiskParams::new(
            rho,
            settings.epsilon,
            settings.alpha,
            settings.norm,
        )
        .unwrap();
        let inputs = EpochInputs {
            epoch: 0,
            scenarios,
            prices: &[1.0],
            initial_soc,
            params,
        };
        let schedule = voltage_schedule();
        let (_, accessors) =
            build_epoch(feeder, settings, &schedule, &inputs).unwrap();
        let result = solve_epoch(
            feeder,
            settings,
            &schedule,
            &inputs,
            &HighsOracle::default(),
        )
        .unwrap();
        (result, accessors)
    }

    fn scenario_set(horizon: usize) -> ScenarioSet {
        ScenarioSet::build(&errors(8), &forecast(), &[0.6], 0, horizon, 0..8)
            .unwrap()
    }

    #[test]
    fn test_risk_weight_trade_off() {
        let feeder = tight_feeder();
        let settings = settings(2);
        let scenarios = scenario_set(2);
        let mut last_cost = f64::NEG_INFINITY;
        let mut last_cvar = f64::INFINITY;
        for rho in [0.01, 0.1, 1.0, 10.0, 100.0] {
            let (result, _) =
                solve(&feeder, &settings, &scenarios, rho, &[0.25]);
            assert_eq!(result.status, SolveStatus::Optimal);
            let cost = result.operating_cost.unwrap();
            let cvar = result.total_cvar();
            assert!(cost >= last_cost - 1e-5, "{rho}: {cost} < {last_cost}");
            assert!(cvar <= last_cvar + 1e-5, "{rho}: {cvar} > {last_cvar}");
            last_cost = cost;
            last_cvar = cvar;
        }
    }

    #[test]
    fn test_same_epoch_twice_gives_same_result() {
        let feeder = tight_feeder();
        let settings = settings(3);
        let scenarios = scenario_set(3);
        let (a, _) = solve(&feeder, &settings, &scenarios, 5.0, &[0.25]);
        let (b, _) = solve(&feeder, &settings, &scenarios, 5.0, &[0.25]);
        assert_eq!(a.status, SolveStatus::Optimal);
        assert!((a.objective.unwrap() - b.objective.unwrap()).abs() < 1e-9);
        for (x, y) in a.schedule.iter().zip(b.schedule.iter()) {
            assert_eq!(x.entity, y.entity);
            assert!((x.value - y.value).abs() < 1e-9);
        }
        assert_eq!(a.first_offset, b.first_offset);
    }

    #[test]
    fn test_single_offset_fixes_storage() {
        let feeder = tight_feeder();
        let settings = settings(1);
        let scenarios = scenario_set(1);
        let (result, accessors) =
            solve(&feeder, &settings, &scenarios, 1.0, &[0.3]);
        assert!(accessors.soc_dynamics.is_empty());
        assert_eq!(result.status, SolveStatus::Optimal);
        let decisions = result.first_offset.unwrap();
        assert!((decisions.soc[0] - 0.3).abs() < 1e-9);
        assert!(decisions.battery_power[0].abs() < 1e-9);

        let params = RiskParams::new(1.0, 0.0, 0.1, TransportNorm::L1).unwrap();
        let inputs = EpochInputs {
            epoch: 0,
            scenarios: &scenarios,
            prices: &[1.0],
            initial_soc: &[0.3],
            params,
        };
        let schedule = voltage_schedule();
        let (program, accessors) =
            build_epoch(&feeder, &settings, &schedule, &inputs).unwrap();
        let bounds = |col: usize| program.column_bounds(col);
        assert_eq!(bounds(accessors.charge[0][0]), (0.0, 0.0));
        assert_eq!(bounds(accessors.discharge[0][0]), (0.0, 0.0));
        assert_eq!(bounds(accessors.soc[0][0]), (0.3, 0.3));
    }

    #[test]
    fn test_multi_offset_has_dynamics_per_battery_and_offset() {
        let feeder = small_feeder();
        let settings = settings(3);
        let scenarios = scenario_set(3);
        let (_, accessors) =
            solve(&feeder, &settings, &scenarios, 1.0, &[0.25]);
        assert_eq!(accessors.soc_dynamics.len(), 3);
        // two voltage kinds on three buses plus four facets on one PV
        assert_eq!(accessors.risk.len(), 3 * (2 * 3 + 4));
    }

    #[test]
    fn test_schedule_controls_active_kinds() {
        let feeder = small_feeder();
        let settings = settings(2);
        let scenarios = scenario_set(2);
        let hm = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        // epoch 0 is 09:00 and offset 1 is 09:15
        let schedule = ActivationSchedule::new(
            hm(9),
            15,
            vec![ActivationRule {
                kind: ConstraintKind::VoltageUpper,
                window: Some(TimeWindow::new(
                    NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                    hm(16),
                )),
            }],
        );
        let inputs = EpochInputs {
            epoch: 0,
            scenarios: &scenarios,
            prices: &[1.0],
            initial_soc: &[0.25],
            params: RiskParams::new(1.0, 0.0, 0.1, TransportNorm::L1).unwrap(),
        };
        let (_, accessors) =
            build_epoch(&feeder, &settings, &schedule, &inputs).unwrap();
        assert_eq!(accessors.risk.len(), 3);
        assert!(accessors.risk.iter().all(|r| r.label.ends_with("h1]")));
    }

    #[test]
    fn test_mpc_carries_soc_and_verifies() {
        let feeder = tight_feeder();
        let settings = settings(3);
        let schedule = voltage_schedule();
        let errors = errors(12);
        let forecast = forecast();
        let case = DistributionCase {
            feeder: &feeder,
            settings: &settings,
            schedule: &schedule,
            forecast: &forecast,
            prices: &[1.0, 1.0, 3.0, 3.0, 0.5],
            errors: &errors,
            num_scenarios: 8,
            num_holdout: 4,
            initial_soc: &[0.25],
        };
        let mut store = ResultStore::new();
        let oracle = HighsOracle::default();
        run_mpc(&case, &[1.0, 10.0], 3, &oracle, &mut store).unwrap();
        assert_eq!(store.len(), 6);
        for record in store.records() {
            assert_eq!(record.status, SolveStatus::Optimal);
            assert_eq!(record.verification.as_ref().unwrap().samples, 4);
        }
        // the second epoch starts from the first epoch's first-offset SOC
        let first = store.get(0, 0).unwrap().scheduled("soc[0,h0]").unwrap();
        let inputs_soc = [first];
        let scenarios =
            ScenarioSet::build(&errors, &forecast, &[0.6], 1, 3, 0..8).unwrap();
        let params = RiskParams::new(
            1.0,
            settings.epsilon,
            settings.alpha,
            settings.norm,
        )
        .unwrap();
        let inputs = EpochInputs {
            epoch: 1,
            scenarios: &scenarios,
            prices: case.prices,
            initial_soc: &inputs_soc,
            params,
        };
        let replay =
            solve_epoch(&feeder, &settings, &schedule, &inputs, &oracle)
                .unwrap()
                .objective
                .unwrap();
        let archived = store.get(0, 1).unwrap().objective.unwrap();
        assert!((replay - archived).abs() < 1e-7);
    }

    #[test]
    fn test_infeasible_epochs_are_archived_and_keep_state() {
        let feeder = small_feeder();
        let settings = settings(2);
        let schedule = voltage_schedule();
        let errors = errors(8);
        let forecast = forecast();
        // an initial SOC far above the battery range cannot be reached
        let case = DistributionCase {
            feeder: &feeder,
            settings: &settings,
            schedule: &schedule,
            forecast: &forecast,
            prices: &[1.0],
            errors: &errors,
            num_scenarios: 8,
            num_holdout: 0,
            initial_soc: &[5.0],
        };
        let mut store = ResultStore::new();
        run_mpc(&case, &[1.0], 2, &HighsOracle::default(), &mut store).unwrap();
        assert_eq!(store.len(), 2);
        for record in store.records() {
            assert_eq!(record.status, SolveStatus::Infeasible);
            assert!(record.objective.is_none());
            assert!(record.schedule.is_empty());
        }
    }

    #[test]
    fn test_wrong_soc_dimension_is_rejected() {
        let feeder = small_feeder();
        let scenarios = scenario_set(2);
        let inputs = EpochInputs {
            epoch: 0,
            scenarios: &scenarios,
            prices: &[1.0],
            initial_soc: &[],
            params: RiskParams::new(1.0, 0.0, 0.1, TransportNorm::L1).unwrap(),
        };
        let schedule = voltage_schedule();
        let err = build_epoch(&feeder, &settings(2), &schedule, &inputs)
            .unwrap_err();
        assert!(matches!(err, DistributionError::SocDimension { .. }));
    }
}
