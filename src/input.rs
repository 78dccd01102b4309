use crate::contingency::{
    ContingencySettings, LineOutageEffect, LineOutageTable,
};
use crate::distribution::DistributionSettings;
use crate::feeder::{self, Feeder, FeederError};
use crate::grid::{self, Grid, GridError};
use crate::risk::{ConstraintKind, TransportNorm};
use crate::scenario::{ErrorDataset, ForecastSeries, ScenarioError, ScenarioSet};
use crate::schedule::{ActivationRule, ActivationSchedule, TimeWindow};
use crate::solver::HighsOracle;
use crate::transmission::TransmissionSettings;
use crate::utils::hold_last;
use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("could not read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("ID {id} not found for {element}")]
    MissingId { element: &'static str, id: usize },
    #[error("invalid time '{value}': {source}")]
    InvalidTime {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("{element} expects {expected} entries, got {found}")]
    EntityCount {
        element: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("line {0} is listed twice in the outage table")]
    DuplicateOutage(usize),
    #[error(transparent)]
    Feeder(#[from] FeederError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}

fn read_json<T: for<'de> Deserialize<'de>>(
    filepath: &str,
) -> Result<T, InputError> {
    let contents =
        fs::read_to_string(filepath).map_err(|source| InputError::Io {
            path: filepath.to_owned(),
            source,
        })?;
    serde_json::from_str(&contents).map_err(|source| InputError::Json {
        path: filepath.to_owned(),
        source,
    })
}

fn default_alpha() -> f64 {
    0.05
}

fn default_max_retries() -> usize {
    4
}

fn default_time_limit() -> f64 {
    300.0
}

fn default_facets() -> usize {
    4
}

fn default_step_minutes() -> u32 {
    15
}

fn default_start_time() -> String {
    "00:00".to_string()
}

fn default_degradation_cost() -> f64 {
    0.001
}

fn default_enabled() -> bool {
    true
}

fn default_emergency_rating() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_time_limit")]
    pub time_limit: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            time_limit: default_time_limit(),
        }
    }
}

impl SolverConfig {
    pub fn oracle(&self) -> HighsOracle {
        HighsOracle::new(self.max_retries, self.time_limit)
    }
}

/// Historical sample configuration. Errors come from `errors_file` when
/// given, otherwise they are drawn with the per-resource `std_devs`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    pub num_samples: usize,
    #[serde(default)]
    pub num_holdout: usize,
    #[serde(default)]
    pub std_devs: Vec<f64>,
    #[serde(default)]
    pub errors_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationInput {
    pub kind: ConstraintKind,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    pub horizon: usize,
    pub num_epochs: usize,
    #[serde(default)]
    pub epsilon: f64,
    #[serde(default = "default_step_minutes")]
    pub step_minutes: u32,
    #[serde(default = "default_start_time")]
    pub start_time: String,
    #[serde(default = "default_facets")]
    pub apparent_power_facets: usize,
    #[serde(default)]
    pub curtailment_penalty: f64,
    #[serde(default = "default_degradation_cost")]
    pub degradation_cost: f64,
    pub activation: Vec<ActivationInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContingencyConfig {
    #[serde(default = "default_enabled")]
    pub loads: bool,
    #[serde(default = "default_enabled")]
    pub generators: bool,
    #[serde(default = "default_enabled")]
    pub lines: bool,
    #[serde(default = "default_emergency_rating")]
    pub emergency_rating: f64,
}

impl Default for ContingencyConfig {
    fn default() -> Self {
        Self {
            loads: true,
            generators: true,
            lines: true,
            emergency_rating: default_emergency_rating(),
        }
    }
}

/// Element disconnected together with a line. At most one of the two ids
/// may be set.
#[derive(Debug, Clone, Deserialize)]
pub struct LineOutageInput {
    pub line_id: usize,
    #[serde(default)]
    pub disconnects_generator: Option<usize>,
    #[serde(default)]
    pub disconnects_load: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransmissionConfig {
    pub epsilons: Vec<f64>,
    #[serde(default)]
    pub contingencies: ContingencyConfig,
    #[serde(default)]
    pub line_outages: Vec<LineOutageInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum StudyConfig {
    Distribution(DistributionConfig),
    Transmission(TransmissionConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub seed: u64,
    pub risk_weights: Vec<f64>,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub transport_norm: TransportNorm,
    pub scenarios: ScenarioConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    pub study: StudyConfig,
}

pub fn read_config_input(filepath: &str) -> Result<Config, InputError> {
    read_json(filepath)
}

fn validate_id_range(
    ids: &[usize],
    element: &'static str,
) -> Result<(), InputError> {
    for id in 0..ids.len() {
        if !ids.contains(&id) {
            return Err(InputError::MissingId { element, id });
        }
    }
    Ok(())
}

fn validate_entity_count(
    found: usize,
    expected: usize,
    element: &'static str,
) -> Result<(), InputError> {
    if found != expected {
        return Err(InputError::EntityCount {
            element,
            expected,
            found,
        });
    }
    Ok(())
}

/// Sorts entities by id after checking the ids form `0..n`.
fn sorted_by_id<T: Clone>(
    entities: &[T],
    id: impl Fn(&T) -> usize,
    element: &'static str,
) -> Result<Vec<T>, InputError> {
    let ids: Vec<usize> = entities.iter().map(&id).collect();
    validate_id_range(&ids, element)?;
    let mut sorted = entities.to_vec();
    sorted.sort_by_key(|e| id(e));
    Ok(sorted)
}

fn parse_time(value: &str) -> Result<NaiveTime, InputError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|source| {
        InputError::InvalidTime {
            value: value.to_owned(),
            source,
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeederBusInput {
    pub id: usize,
    pub active_load: Vec<f64>,
    pub reactive_load: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeederBranchInput {
    pub id: usize,
    pub from_bus: usize,
    pub to_bus: usize,
    pub resistance: f64,
    pub reactance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PvInput {
    pub id: usize,
    pub bus_id: usize,
    pub capacity: f64,
    pub apparent_rating: f64,
    pub forecast: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryInput {
    pub id: usize,
    pub bus_id: usize,
    pub max_power: f64,
    pub min_soc: f64,
    pub max_soc: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
    pub initial_soc: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeederInput {
    pub substation_voltage: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    /// Energy price per time step
    pub prices: Vec<f64>,
    pub buses: Vec<FeederBusInput>,
    pub branches: Vec<FeederBranchInput>,
    pub pvs: Vec<PvInput>,
    pub batteries: Vec<BatteryInput>,
}

pub fn read_feeder_input(filepath: &str) -> Result<FeederInput, InputError> {
    read_json(filepath)
}

impl FeederInput {
    pub fn build_feeder(&self) -> Result<Feeder, InputError> {
        let buses = sorted_by_id(&self.buses, |b| b.id, "buses")?
            .into_iter()
            .map(|b| {
                feeder::FeederBus::new(b.id, b.active_load, b.reactive_load)
            })
            .collect();
        let branches = sorted_by_id(&self.branches, |b| b.id, "branches")?
            .into_iter()
            .map(|b| {
                feeder::FeederBranch::new(
                    b.id,
                    b.from_bus,
                    b.to_bus,
                    b.resistance,
                    b.reactance,
                )
            })
            .collect();
        let pvs = sorted_by_id(&self.pvs, |p| p.id, "pvs")?
            .into_iter()
            .map(|p| {
                feeder::PvUnit::new(
                    p.id,
                    p.bus_id,
                    p.capacity,
                    p.apparent_rating,
                )
            })
            .collect();
        let batteries = sorted_by_id(&self.batteries, |b| b.id, "batteries")?
            .into_iter()
            .map(|b| {
                feeder::Battery::new(
                    b.id,
                    b.bus_id,
                    b.max_power,
                    b.min_soc,
                    b.max_soc,
                    b.charge_efficiency,
                    b.discharge_efficiency,
                )
            })
            .collect();
        Ok(Feeder::new(
            buses,
            branches,
            pvs,
            batteries,
            self.substation_voltage,
            self.min_voltage,
            self.max_voltage,
        )?)
    }

    /// PV forecasts transposed to `[time][pv]`. Shorter series hold their
    /// last value.
    pub fn build_forecast(&self) -> Result<ForecastSeries, InputError> {
        let pvs = sorted_by_id(&self.pvs, |p| p.id, "pvs")?;
        let length = pvs.iter().map(|p| p.forecast.len()).max().unwrap_or(0);
        let values = (0..length)
            .map(|t| {
                pvs.iter()
                    .map(|p| hold_last(&p.forecast, t))
                    .collect()
            })
            .collect();
        Ok(ForecastSeries::new(values))
    }

    pub fn build_initial_soc(&self) -> Result<Vec<f64>, InputError> {
        Ok(sorted_by_id(&self.batteries, |b| b.id, "batteries")?
            .iter()
            .map(|b| b.initial_soc)
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridBusInput {
    pub id: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineInput {
    pub id: usize,
    pub from_bus: usize,
    pub to_bus: usize,
    pub reactance: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorInput {
    pub id: usize,
    pub bus_id: usize,
    pub cost: f64,
    pub min_output: f64,
    pub max_output: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadInput {
    pub id: usize,
    pub bus_id: usize,
    pub demand: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindFarmInput {
    pub id: usize,
    pub bus_id: usize,
    pub capacity: f64,
    pub forecast: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridInput {
    pub slack_bus: usize,
    pub buses: Vec<GridBusInput>,
    pub lines: Vec<LineInput>,
    pub generators: Vec<GeneratorInput>,
    pub loads: Vec<LoadInput>,
    pub wind_farms: Vec<WindFarmInput>,
}

pub fn read_grid_input(filepath: &str) -> Result<GridInput, InputError> {
    read_json(filepath)
}

impl GridInput {
    pub fn build_grid(&self) -> Result<Grid, InputError> {
        let bus_ids: Vec<usize> = self.buses.iter().map(|b| b.id).collect();
        validate_id_range(&bus_ids, "buses")?;
        let lines = sorted_by_id(&self.lines, |l| l.id, "lines")?
            .into_iter()
            .map(|l| {
                grid::TransmissionLine::new(
                    l.id,
                    l.from_bus,
                    l.to_bus,
                    l.reactance,
                    l.limit,
                )
            })
            .collect();
        let generators = sorted_by_id(&self.generators, |g| g.id, "generators")?
            .into_iter()
            .map(|g| {
                grid::Generator::new(
                    g.id,
                    g.bus_id,
                    g.cost,
                    g.min_output,
                    g.max_output,
                )
            })
            .collect();
        let loads = sorted_by_id(&self.loads, |d| d.id, "loads")?
            .into_iter()
            .map(|d| grid::Load::new(d.id, d.bus_id, d.demand))
            .collect();
        let wind_farms = sorted_by_id(&self.wind_farms, |w| w.id, "wind farms")?
            .into_iter()
            .map(|w| {
                grid::WindFarm::new(w.id, w.bus_id, w.capacity, w.forecast)
            })
            .collect();
        Ok(Grid::new(
            self.buses.len(),
            self.slack_bus,
            lines,
            generators,
            loads,
            wind_farms,
        )?)
    }
}

/// Everything the receding-horizon sweep reads from disk.
#[derive(Debug, Clone)]
pub struct DistributionInput {
    pub feeder: Feeder,
    pub settings: DistributionSettings,
    pub schedule: ActivationSchedule,
    pub forecast: ForecastSeries,
    pub prices: Vec<f64>,
    pub errors: ErrorDataset,
    pub initial_soc: Vec<f64>,
    pub num_epochs: usize,
    pub num_scenarios: usize,
    pub num_holdout: usize,
}

/// Everything the radius sweep reads from disk.
#[derive(Debug, Clone)]
pub struct TransmissionInput {
    pub grid: Grid,
    pub settings: TransmissionSettings,
    pub table: LineOutageTable,
    pub samples: ScenarioSet,
    pub holdout: Option<ScenarioSet>,
    pub epsilons: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum Study {
    Distribution(Box<DistributionInput>),
    Transmission(Box<TransmissionInput>),
}

fn read_errors(
    path: &str,
    scenarios: &ScenarioConfig,
    num_epochs: usize,
    num_offsets: usize,
    num_resources: usize,
    seed: u64,
) -> Result<ErrorDataset, InputError> {
    match &scenarios.errors_file {
        Some(file) => {
            let dataset = ErrorDataset::from_csv(&Path::new(path).join(file))?;
            validate_entity_count(
                dataset.num_resources,
                num_resources,
                "error resources",
            )?;
            // every sample and hold-out draw must be a historical scenario
            let required = scenarios.num_samples + scenarios.num_holdout;
            if dataset.num_scenarios < required {
                return Err(InputError::EntityCount {
                    element: "error scenarios",
                    expected: required,
                    found: dataset.num_scenarios,
                });
            }
            Ok(dataset)
        }
        None => {
            validate_entity_count(
                scenarios.std_devs.len(),
                num_resources,
                "std_devs",
            )?;
            Ok(ErrorDataset::synthetic(
                num_epochs,
                num_offsets,
                scenarios.num_samples + scenarios.num_holdout,
                &scenarios.std_devs,
                seed,
            )?)
        }
    }
}

fn build_schedule(
    study: &DistributionConfig,
) -> Result<ActivationSchedule, InputError> {
    let start = parse_time(&study.start_time)?;
    let mut rules =
        Vec::<ActivationRule>::with_capacity(study.activation.len());
    for rule in study.activation.iter() {
        let midnight = NaiveTime::default();
        let window = match (&rule.start, &rule.end) {
            (Some(s), Some(e)) => {
                Some(TimeWindow::new(parse_time(s)?, parse_time(e)?))
            }
            (Some(s), None) => Some(TimeWindow::new(parse_time(s)?, midnight)),
            (None, Some(e)) => Some(TimeWindow::new(midnight, parse_time(e)?)),
            (None, None) => None,
        };
        rules.push(ActivationRule {
            kind: rule.kind,
            window,
        });
    }
    Ok(ActivationSchedule::new(start, study.step_minutes, rules))
}

fn validate_id(
    id: usize,
    count: usize,
    element: &'static str,
) -> Result<(), InputError> {
    if id >= count {
        return Err(InputError::MissingId { element, id });
    }
    Ok(())
}

/// Builds the outage table, checking every line, generator and load id
/// against the grid.
fn build_outage_table(
    grid: &Grid,
    outages: &[LineOutageInput],
) -> Result<LineOutageTable, InputError> {
    let mut table = LineOutageTable::new();
    let mut seen = HashSet::<usize>::new();
    for outage in outages.iter() {
        validate_id(outage.line_id, grid.lines.len(), "outage lines")?;
        let effect = match (
            outage.disconnects_generator,
            outage.disconnects_load,
        ) {
            (Some(g), None) => {
                validate_id(g, grid.generators.len(), "outage generators")?;
                LineOutageEffect::DisconnectsGenerator(g)
            }
            (None, Some(d)) => {
                validate_id(d, grid.loads.len(), "outage loads")?;
                LineOutageEffect::DisconnectsLoad(d)
            }
            (None, None) => LineOutageEffect::None,
            (Some(_), Some(_)) => {
                return Err(InputError::EntityCount {
                    element: "line outage effects",
                    expected: 1,
                    found: 2,
                })
            }
        };
        if !seen.insert(outage.line_id) {
            return Err(InputError::DuplicateOutage(outage.line_id));
        }
        table.insert(outage.line_id, effect);
    }
    Ok(table)
}

fn build_distribution(
    path: &str,
    config: &Config,
    study: &DistributionConfig,
) -> Result<DistributionInput, InputError> {
    let system = read_feeder_input(&(path.to_owned() + "/feeder.json"))?;
    let feeder = system.build_feeder()?;
    let forecast = system.build_forecast()?;
    let initial_soc = system.build_initial_soc()?;
    let errors = read_errors(
        path,
        &config.scenarios,
        study.num_epochs,
        study.horizon,
        feeder.pvs.len(),
        config.seed,
    )?;
    let settings = DistributionSettings {
        horizon: study.horizon,
        step_hours: study.step_minutes as f64 / 60.0,
        alpha: config.alpha,
        epsilon: study.epsilon,
        norm: config.transport_norm,
        apparent_power_facets: study.apparent_power_facets,
        curtailment_penalty: study.curtailment_penalty,
        degradation_cost: study.degradation_cost,
    };
    Ok(DistributionInput {
        schedule: build_schedule(study)?,
        feeder,
        settings,
        forecast,
        prices: system.prices,
        errors,
        initial_soc,
        num_epochs: study.num_epochs,
        num_scenarios: config.scenarios.num_samples,
        num_holdout: config.scenarios.num_holdout,
    })
}

fn build_transmission(
    path: &str,
    config: &Config,
    study: &TransmissionConfig,
) -> Result<TransmissionInput, InputError> {
    let system = read_grid_input(&(path.to_owned() + "/grid.json"))?;
    let grid = system.build_grid()?;
    let forecast: Vec<f64> =
        grid.wind_farms.iter().map(|w| w.forecast).collect();
    let capacities: Vec<f64> =
        grid.wind_farms.iter().map(|w| w.capacity).collect();
    let errors = read_errors(
        path,
        &config.scenarios,
        1,
        1,
        grid.wind_farms.len(),
        config.seed,
    )?;
    let series = ForecastSeries::new(vec![forecast]);
    let num_samples = config.scenarios.num_samples;
    let samples = ScenarioSet::build(
        &errors,
        &series,
        &capacities,
        0,
        1,
        0..num_samples,
    )?;
    let holdout = match config.scenarios.num_holdout {
        0 => None,
        n => Some(ScenarioSet::build(
            &errors,
            &series,
            &capacities,
            0,
            1,
            num_samples..num_samples + n,
        )?),
    };
    let contingencies = &study.contingencies;
    let settings = TransmissionSettings {
        alpha: config.alpha,
        norm: config.transport_norm,
        contingencies: ContingencySettings {
            loads: contingencies.loads,
            generators: contingencies.generators,
            lines: contingencies.lines,
            emergency_rating: contingencies.emergency_rating,
        },
    };
    let table = build_outage_table(&grid, &study.line_outages)?;
    Ok(TransmissionInput {
        grid,
        settings,
        table,
        samples,
        holdout,
        epsilons: study.epsilons.clone(),
    })
}

pub struct Input {
    pub config: Config,
    pub study: Study,
}

impl Input {
    pub fn build(path: &str) -> Result<Self, InputError> {
        let config = read_config_input(&(path.to_owned() + "/config.json"))?;
        let study = match &config.study {
            StudyConfig::Distribution(study) => {
                let input = build_distribution(path, &config, study)?;
                Study::Distribution(Box::new(input))
            }
            StudyConfig::Transmission(study) => {
                let input = build_transmission(path, &config, study)?;
                Study::Transmission(Box::new(input))
            }
        };
        Ok(Self { config, study })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_distribution_config() {
        let config =
            read_config_input("example/distribution/config.json").unwrap();
        assert_eq!(config.risk_weights.len(), 3);
        assert_eq!(config.transport_norm, TransportNorm::L1);
        match config.study {
            StudyConfig::Distribution(study) => {
                assert_eq!(study.horizon, 4);
                assert_eq!(study.activation.len(), 3);
            }
            StudyConfig::Transmission(_) => {
                panic!("expected a distribution study")
            }
        }
    }

    #[test]
    fn test_read_transmission_config() {
        let config =
            read_config_input("example/transmission/config.json").unwrap();
        match config.study {
            StudyConfig::Transmission(study) => {
                assert_eq!(study.epsilons.len(), 3);
                assert_eq!(study.line_outages.len(), 1);
                assert!(study.contingencies.generators);
            }
            StudyConfig::Distribution(_) => {
                panic!("expected a transmission study")
            }
        }
    }

    #[test]
    fn test_build_feeder() {
        let system =
            read_feeder_input("example/distribution/feeder.json").unwrap();
        let feeder = system.build_feeder().unwrap();
        assert_eq!(feeder.num_buses(), 5);
        assert_eq!(feeder.pvs.len(), 2);
        assert_eq!(feeder.batteries.len(), 1);
        let forecast = system.build_forecast().unwrap();
        assert_eq!(forecast.len(), 8);
    }

    #[test]
    fn test_build_grid() {
        let system = read_grid_input("example/transmission/grid.json").unwrap();
        let grid = system.build_grid().unwrap();
        assert_eq!(grid.num_buses, 4);
        assert_eq!(grid.lines.len(), 4);
        assert_eq!(grid.generators.len(), 2);
    }

    #[test]
    fn test_validate_id_range() {
        assert!(validate_id_range(&[2, 0, 1], "buses").is_ok());
        let err = validate_id_range(&[0, 2], "buses").unwrap_err();
        assert!(matches!(err, InputError::MissingId { id: 1, .. }));
    }

    #[test]
    fn test_outage_table_rejects_duplicates() {
        let outages = vec![
            LineOutageInput {
                line_id: 3,
                disconnects_generator: None,
                disconnects_load: Some(1),
            },
            LineOutageInput {
                line_id: 3,
                disconnects_generator: Some(0),
                disconnects_load: None,
            },
        ];
        assert!(matches!(
            build_outage_table(&example_grid(), &outages),
            Err(InputError::DuplicateOutage(3))
        ));
    }

    fn example_grid() -> Grid {
        read_grid_input("example/transmission/grid.json")
            .unwrap()
            .build_grid()
            .unwrap()
    }

    fn outage(
        line_id: usize,
        generator: Option<usize>,
        load: Option<usize>,
    ) -> LineOutageInput {
        LineOutageInput {
            line_id,
            disconnects_generator: generator,
            disconnects_load: load,
        }
    }

    #[test]
    fn test_outage_table_rejects_unknown_ids() {
        let grid = example_grid();
        assert!(matches!(
            build_outage_table(&grid, &[outage(0, Some(7), None)]),
            Err(InputError::MissingId { id: 7, .. })
        ));
        assert!(matches!(
            build_outage_table(&grid, &[outage(3, None, Some(2))]),
            Err(InputError::MissingId { id: 2, .. })
        ));
        assert!(matches!(
            build_outage_table(&grid, &[outage(9, None, None)]),
            Err(InputError::MissingId { id: 9, .. })
        ));
        let table =
            build_outage_table(&grid, &[outage(3, None, Some(1))]).unwrap();
        assert_eq!(table.effect(3), LineOutageEffect::DisconnectsLoad(1));
    }

    #[test]
    fn test_error_file_must_cover_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = String::from("epoch,offset,scenario,resource,error\n");
        for s in 0..2 {
            rows.push_str(&format!("0,0,{s},0,{}\n", 1.0 + s as f64));
        }
        fs::write(dir.path().join("errors.csv"), rows).unwrap();
        let path = dir.path().to_str().unwrap();
        let mut scenarios = ScenarioConfig {
            num_samples: 6,
            num_holdout: 0,
            std_devs: vec![],
            errors_file: Some("errors.csv".to_string()),
        };
        assert!(matches!(
            read_errors(path, &scenarios, 1, 1, 1, 0),
            Err(InputError::EntityCount {
                expected: 6,
                found: 2,
                ..
            })
        ));
        scenarios.num_samples = 1;
        scenarios.num_holdout = 1;
        let dataset = read_errors(path, &scenarios, 1, 1, 1, 0).unwrap();
        assert_eq!(dataset.num_scenarios, 2);
    }

    #[test]
    fn test_schedule_windows() {
        let study: DistributionConfig = serde_json::from_str(
            r#"{
                "horizon": 2,
                "num_epochs": 4,
                "start_time": "11:30",
                "step_minutes": 30,
                "activation": [
                    {"kind": "voltage_upper", "start": "12:00", "end": "13:00"},
                    {"kind": "apparent_power"}
                ]
            }"#,
        )
        .unwrap();
        let schedule = build_schedule(&study).unwrap();
        assert!(!schedule.is_active(ConstraintKind::VoltageUpper, 0));
        assert!(schedule.is_active(ConstraintKind::VoltageUpper, 1));
        assert!(!schedule.is_active(ConstraintKind::VoltageUpper, 3));
        assert!(schedule.is_active(ConstraintKind::ApparentPower, 3));
        assert!(!schedule.is_active(ConstraintKind::VoltageLower, 1));
    }

    #[test]
    fn test_invalid_time() {
        assert!(matches!(
            parse_time("25:99"),
            Err(InputError::InvalidTime { .. })
        ));
    }

    #[test]
    fn test_read_input() {
        let input = Input::build("example/transmission").unwrap();
        match input.study {
            Study::Transmission(study) => {
                assert_eq!(study.samples.num_scenarios, 20);
                assert!(study.holdout.is_some());
            }
            Study::Distribution(_) => panic!("expected a transmission study"),
        }
    }
}
