use rand::prelude::*;
use rand_distr::Normal;
use rand_xoshiro::Xoshiro256Plus;
use serde::Deserialize;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("error dataset expects {expected} values, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("invalid error standard deviation {0} for resource {1}")]
    InvalidStdDev(f64, usize),
    #[error("scenario range {0:?} is empty")]
    EmptyScenarioRange(Range<usize>),
    #[error("forecast and capacity sizes differ: {0} != {1}")]
    ResourceMismatch(usize, usize),
    #[error("could not read error dataset: {0}")]
    Csv(#[from] csv::Error),
}

/// Historical forecast errors with axis order
/// `[epoch][horizon offset][scenario][resource]`.
#[derive(Debug, Clone)]
pub struct ErrorDataset {
    pub num_epochs: usize,
    pub num_offsets: usize,
    pub num_scenarios: usize,
    pub num_resources: usize,
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct ErrorRecord {
    epoch: usize,
    offset: usize,
    scenario: usize,
    resource: usize,
    error: f64,
}

impl ErrorDataset {
    pub fn new(
        num_epochs: usize,
        num_offsets: usize,
        num_scenarios: usize,
        num_resources: usize,
        values: Vec<f64>,
    ) -> Result<Self, ScenarioError> {
        let expected = num_epochs * num_offsets * num_scenarios * num_resources;
        if values.len() != expected {
            return Err(ScenarioError::DimensionMismatch {
                expected,
                found: values.len(),
            });
        }
        Ok(Self {
            num_epochs,
            num_offsets,
            num_scenarios,
            num_resources,
            values,
        })
    }

    /// Gaussian errors with a per-resource standard deviation, drawn from a
    /// seeded generator so that runs are reproducible.
    pub fn synthetic(
        num_epochs: usize,
        num_offsets: usize,
        num_scenarios: usize,
        std_devs: &[f64],
        seed: u64,
    ) -> Result<Self, ScenarioError> {
        let distributions = std_devs
            .iter()
            .enumerate()
            .map(|(r, sd)| {
                Normal::new(0.0, *sd)
                    .map_err(|_| ScenarioError::InvalidStdDev(*sd, r))
            })
            .collect::<Result<Vec<Normal<f64>>, ScenarioError>>()?;
        let num_resources = distributions.len();
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let mut values = Vec::<f64>::with_capacity(
            num_epochs * num_offsets * num_scenarios * num_resources,
        );
        for _ in 0..(num_epochs * num_offsets * num_scenarios) {
            for distribution in distributions.iter() {
                values.push(distribution.sample(&mut rng));
            }
        }
        Self::new(num_epochs, num_offsets, num_scenarios, num_resources, values)
    }

    /// Reads `epoch,offset,scenario,resource,error` rows. Missing entries are
    /// zero errors.
    pub fn from_csv(path: &Path) -> Result<Self, ScenarioError> {
        let mut rdr = csv::Reader::from_path(path)?;
        let records = rdr
            .deserialize()
            .collect::<Result<Vec<ErrorRecord>, csv::Error>>()?;
        let dim = |f: fn(&ErrorRecord) -> usize| {
            records.iter().map(f).max().map(|m| m + 1).unwrap_or(0)
        };
        let num_epochs = dim(|r| r.epoch);
        let num_offsets = dim(|r| r.offset);
        let num_scenarios = dim(|r| r.scenario);
        let num_resources = dim(|r| r.resource);
        let mut dataset = Self::new(
            num_epochs,
            num_offsets,
            num_scenarios,
            num_resources,
            vec![0.0; num_epochs * num_offsets * num_scenarios * num_resources],
        )?;
        for r in records.iter() {
            let index =
                dataset.index(r.epoch, r.offset, r.scenario, r.resource);
            dataset.values[index] = r.error;
        }
        Ok(dataset)
    }

    fn index(
        &self,
        epoch: usize,
        offset: usize,
        scenario: usize,
        resource: usize,
    ) -> usize {
        ((epoch * self.num_offsets + offset) * self.num_scenarios + scenario)
            * self.num_resources
            + resource
    }

    /// Forecast error, or zero outside the historical window.
    pub fn error(
        &self,
        epoch: usize,
        offset: usize,
        scenario: usize,
        resource: usize,
    ) -> f64 {
        if epoch >= self.num_epochs
            || offset >= self.num_offsets
            || scenario >= self.num_scenarios
            || resource >= self.num_resources
        {
            return 0.0;
        }
        let e = self.values[self.index(epoch, offset, scenario, resource)];
        if e.is_finite() {
            e
        } else {
            0.0
        }
    }
}

/// Nominal forecast indexed by `[time][resource]`. Lookups past the end hold
/// the last available value.
#[derive(Debug, Clone, Default)]
pub struct ForecastSeries {
    values: Vec<Vec<f64>>,
}

impl ForecastSeries {
    pub fn new(values: Vec<Vec<f64>>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn at(&self, time: usize, resource: usize) -> f64 {
        self.values
            .get(time)
            .or_else(|| self.values.last())
            .and_then(|row| row.get(resource))
            .copied()
            .unwrap_or(0.0)
    }
}

fn clip(forecast: f64, error: f64, capacity: f64) -> f64 {
    let value = forecast + error;
    let value = if value.is_finite() { value } else { forecast };
    let clipped = value.max(0.0).min(capacity);
    if clipped.is_finite() {
        clipped
    } else {
        0.0
    }
}

/// Realized resource output per `[scenario][offset][resource]`, the
/// empirical distribution shared by every risk constraint of one solve.
#[derive(Debug, Clone)]
pub struct ScenarioSet {
    pub num_scenarios: usize,
    pub horizon: usize,
    pub num_resources: usize,
    forecast: Vec<f64>,
    realized: Vec<f64>,
}

impl ScenarioSet {
    /// Builds the window `epoch..epoch + horizon` from historical errors,
    /// taking the dataset scenarios in `scenarios`.
    pub fn build(
        dataset: &ErrorDataset,
        forecast: &ForecastSeries,
        capacities: &[f64],
        epoch: usize,
        horizon: usize,
        scenarios: Range<usize>,
    ) -> Result<Self, ScenarioError> {
        if scenarios.is_empty() {
            return Err(ScenarioError::EmptyScenarioRange(scenarios));
        }
        let num_resources = capacities.len();
        let num_scenarios = scenarios.len();
        let mut nominal = Vec::<f64>::with_capacity(horizon * num_resources);
        for h in 0..horizon {
            for (r, capacity) in capacities.iter().enumerate() {
                nominal.push(clip(forecast.at(epoch + h, r), 0.0, *capacity));
            }
        }
        let mut realized =
            Vec::<f64>::with_capacity(num_scenarios * horizon * num_resources);
        for s in scenarios {
            for h in 0..horizon {
                for (r, capacity) in capacities.iter().enumerate() {
                    let error = dataset.error(epoch, h, s, r);
                    let expected = forecast.at(epoch + h, r);
                    realized.push(clip(expected, error, *capacity));
                }
            }
        }
        Ok(Self {
            num_scenarios,
            horizon,
            num_resources,
            forecast: nominal,
            realized,
        })
    }

    /// Single-offset set from a static `[scenario][resource]` error sample.
    pub fn static_samples(
        errors: &[Vec<f64>],
        forecast: &[f64],
        capacities: &[f64],
    ) -> Result<Self, ScenarioError> {
        if forecast.len() != capacities.len() {
            return Err(ScenarioError::ResourceMismatch(
                forecast.len(),
                capacities.len(),
            ));
        }
        if errors.is_empty() {
            return Err(ScenarioError::EmptyScenarioRange(0..0));
        }
        let realized = errors
            .iter()
            .flat_map(|sample| {
                forecast.iter().zip(capacities.iter()).enumerate().map(
                    move |(r, (f, c))| {
                        clip(*f, sample.get(r).copied().unwrap_or(0.0), *c)
                    },
                )
            })
            .collect();
        Ok(Self {
            num_scenarios: errors.len(),
            horizon: 1,
            num_resources: forecast.len(),
            forecast: forecast
                .iter()
                .zip(capacities.iter())
                .map(|(f, c)| clip(*f, 0.0, *c))
                .collect(),
            realized,
        })
    }

    pub fn realized(
        &self,
        scenario: usize,
        offset: usize,
        resource: usize,
    ) -> f64 {
        self.realized[(scenario * self.horizon + offset) * self.num_resources
            + resource]
    }

    pub fn forecast(&self, offset: usize, resource: usize) -> f64 {
        self.forecast[offset * self.num_resources + resource]
    }

    pub fn mean(&self, offset: usize, resource: usize) -> f64 {
        (0..self.num_scenarios)
            .map(|s| self.realized(s, offset, resource))
            .sum::<f64>()
            / self.num_scenarios as f64
    }

    /// Realized deviation from the clipped forecast.
    pub fn deviation(
        &self,
        scenario: usize,
        offset: usize,
        resource: usize,
    ) -> f64 {
        self.realized(scenario, offset, resource)
            - self.forecast(offset, resource)
    }
}
