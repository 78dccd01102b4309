//! N-1 contingency screening. Every contingency adds hard post-outage rows
//! on the nominal generation schedule, with a linear recourse policy that
//! covers the lost quantity.

use crate::grid::{self, FlowMapping, Grid, GridError};
use crate::program::{LinExpr, Program};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContingencyKind {
    LoadLoss(usize),
    GeneratorLoss(usize),
    LineLoss(usize),
}

/// Extra element lost together with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineOutageEffect {
    #[default]
    None,
    DisconnectsGenerator(usize),
    DisconnectsLoad(usize),
}

/// Explicit map from line id to the element its outage disconnects. Lines
/// not in the table disconnect nothing.
#[derive(Debug, Clone, Default)]
pub struct LineOutageTable {
    effects: HashMap<usize, LineOutageEffect>,
}

impl LineOutageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, line_id: usize, effect: LineOutageEffect) {
        self.effects.insert(line_id, effect);
    }

    pub fn effect(&self, line_id: usize) -> LineOutageEffect {
        self.effects.get(&line_id).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ContingencySettings {
    pub loads: bool,
    pub generators: bool,
    pub lines: bool,
    /// Post-contingency limits are `emergency_rating * limit`
    pub emergency_rating: f64,
}

impl Default for ContingencySettings {
    fn default() -> Self {
        Self {
            loads: true,
            generators: true,
            lines: true,
            emergency_rating: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contingency {
    pub kind: ContingencyKind,
    pub label: String,
    pub effect: LineOutageEffect,
}

/// Lists the enabled single-element outages of `grid`.
pub fn enumerate(
    grid: &Grid,
    settings: &ContingencySettings,
    table: &LineOutageTable,
) -> Vec<Contingency> {
    let mut contingencies = Vec::<Contingency>::new();
    if settings.loads {
        for d in grid.loads.iter() {
            contingencies.push(Contingency {
                kind: ContingencyKind::LoadLoss(d.id),
                label: format!("load_{}", d.id),
                effect: LineOutageEffect::DisconnectsLoad(d.id),
            });
        }
    }
    if settings.generators {
        for g in grid.generators.iter() {
            contingencies.push(Contingency {
                kind: ContingencyKind::GeneratorLoss(g.id),
                label: format!("generator_{}", g.id),
                effect: LineOutageEffect::DisconnectsGenerator(g.id),
            });
        }
    }
    if settings.lines {
        for l in grid.lines.iter() {
            contingencies.push(Contingency {
                kind: ContingencyKind::LineLoss(l.id),
                label: format!("line_{}", l.id),
                effect: table.effect(l.id),
            });
        }
    }
    contingencies
}

/// Flow mappings with one line out, built once per sweep.
#[derive(Debug, Default)]
pub struct FlowMappingCache {
    mappings: HashMap<usize, FlowMapping>,
    builds: usize,
}

impl FlowMappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_line(
        &mut self,
        grid: &Grid,
        line_id: usize,
    ) -> Result<&FlowMapping, GridError> {
        if !self.mappings.contains_key(&line_id) {
            let retained: Vec<usize> = grid
                .all_lines()
                .into_iter()
                .filter(|l| *l != line_id)
                .collect();
            let mapping = grid::flow_mapping(grid, &retained)?;
            self.builds += 1;
            self.mappings.insert(line_id, mapping);
        }
        self.mappings
            .get(&line_id)
            .ok_or(GridError::UnknownLine(line_id))
    }

    pub fn builds(&self) -> usize {
        self.builds
    }
}

/// Fails when an outage islands a bus whose injections are not exactly the
/// element the outage table says it disconnects.
pub fn check_islands(
    grid: &Grid,
    line_id: usize,
    effect: LineOutageEffect,
    mapping: &FlowMapping,
) -> Result<(), GridError> {
    for &bus in mapping.islanded_buses.iter() {
        if !grid.has_injections(bus) {
            continue;
        }
        let generators: Vec<usize> = grid
            .generators
            .iter()
            .filter(|g| g.bus_id == bus)
            .map(|g| g.id)
            .collect();
        let loads: Vec<usize> = grid
            .loads
            .iter()
            .filter(|d| d.bus_id == bus)
            .map(|d| d.id)
            .collect();
        let has_wind = grid.wind_farms.iter().any(|w| w.bus_id == bus);
        let covered = !has_wind
            && match effect {
                LineOutageEffect::DisconnectsGenerator(g) => {
                    generators == [g] && loads.is_empty()
                }
                LineOutageEffect::DisconnectsLoad(d) => {
                    loads == [d] && generators.is_empty()
                }
                LineOutageEffect::None => false,
            };
        if !covered {
            return Err(GridError::UnhandledIsland { line: line_id, bus });
        }
    }
    Ok(())
}

/// Post-outage recourse columns of one contingency.
#[derive(Debug, Clone)]
pub struct ContingencyAccessors {
    pub kind: ContingencyKind,
    pub label: String,
    /// One recourse coefficient per generator, empty when the outage needs
    /// no redispatch
    pub recourse: Vec<usize>,
    /// Scheduled output column of the lost generator
    pub lost_generation: Option<usize>,
    pub flow_rows: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContingencyReport {
    pub label: String,
    pub recourse_sum: f64,
    pub expected_sum: f64,
}

impl ContingencyAccessors {
    /// Sum of the recourse coefficients next to the quantity they must cover:
    /// one for a lost load, the scheduled output for a lost generator.
    pub fn report(&self, primal: &[f64]) -> ContingencyReport {
        let recourse_sum = self.recourse.iter().map(|c| primal[*c]).sum();
        let expected_sum = match self.lost_generation {
            Some(col) => primal[col],
            None if self.recourse.is_empty() => 0.0,
            None => 1.0,
        };
        ContingencyReport {
            label: self.label.clone(),
            recourse_sum,
            expected_sum,
        }
    }
}

/// Nominal bus injections `Σ p_g + Σ forecast_w - L_n` over the generation
/// columns.
pub fn nominal_injections(grid: &Grid, generation: &[usize]) -> Vec<LinExpr> {
    let mut injections: Vec<LinExpr> = (0..grid.num_buses)
        .map(|bus| LinExpr::constant(-grid.bus_demand(bus)))
        .collect();
    for (g, generator) in grid.generators.iter().enumerate() {
        injections[generator.bus_id].add_term(generation[g], 1.0);
    }
    for w in grid.wind_farms.iter() {
        injections[w.bus_id].add_constant(w.forecast);
    }
    injections
}

fn add_flow_rows(
    program: &mut Program,
    mapping: &FlowMapping,
    injections: &[LinExpr],
    emergency_rating: f64,
) -> Vec<usize> {
    (0..mapping.num_lines())
        .map(|row| {
            let mut flow = LinExpr::new();
            for (bus, injection) in injections.iter().enumerate() {
                flow.add_scaled(injection, mapping.factor(row, bus));
            }
            let limit = emergency_rating * mapping.limits[row];
            program.add_constraint(&flow, -limit, limit)
        })
        .collect()
}

/// `γ_g ∈ [0, 1]`, `Σ γ_g = 1` and `p_g - L γ_g >= pmin_g`.
fn add_load_recourse(
    program: &mut Program,
    grid: &Grid,
    generation: &[usize],
    injections: &mut [LinExpr],
    load_id: usize,
) -> Vec<usize> {
    let load = &grid.loads[load_id];
    let recourse: Vec<usize> = grid
        .generators
        .iter()
        .map(|_| program.add_column(0.0, 0.0..=1.0))
        .collect();
    let mut sum = LinExpr::new();
    for (g, generator) in grid.generators.iter().enumerate() {
        sum.add_term(recourse[g], 1.0);
        let mut output = LinExpr::term(generation[g], 1.0);
        output.add_term(recourse[g], -load.demand);
        program.add_ge(&output, generator.min_output);
        injections[generator.bus_id].add_term(recourse[g], -load.demand);
    }
    program.add_eq(&sum, 1.0);
    injections[load.bus_id].add_constant(load.demand);
    recourse
}

/// `δ_g >= 0`, `δ_k = 0`, `Σ δ_g = p_k` and `p_g + δ_g <= pmax_g`.
fn add_generator_recourse(
    program: &mut Program,
    grid: &Grid,
    generation: &[usize],
    injections: &mut [LinExpr],
    lost: usize,
) -> Vec<usize> {
    let recourse: Vec<usize> = grid
        .generators
        .iter()
        .enumerate()
        .map(|(g, _)| {
            if g == lost {
                program.add_column(0.0, 0.0..=0.0)
            } else {
                program.add_column(0.0, 0.0..)
            }
        })
        .collect();
    let mut sum = LinExpr::term(generation[lost], -1.0);
    for (g, generator) in grid.generators.iter().enumerate() {
        sum.add_term(recourse[g], 1.0);
        let mut output = LinExpr::term(generation[g], 1.0);
        output.add_term(recourse[g], 1.0);
        program.add_le(&output, generator.max_output);
        injections[generator.bus_id].add_term(recourse[g], 1.0);
    }
    program.add_eq(&sum, 0.0);
    injections[grid.generators[lost].bus_id].add_term(generation[lost], -1.0);
    recourse
}

/// Adds the post-contingency rows of `contingency` on the shared generation
/// columns. Load and generator losses are checked on `base`; line losses on
/// the mapping with the line removed.
pub fn add_contingency(
    program: &mut Program,
    grid: &Grid,
    contingency: &Contingency,
    generation: &[usize],
    base: &FlowMapping,
    cache: &mut FlowMappingCache,
    settings: &ContingencySettings,
) -> Result<ContingencyAccessors, GridError> {
    let mut injections = nominal_injections(grid, generation);
    let mapping = match contingency.kind {
        ContingencyKind::LineLoss(line_id) => {
            let mapping = cache.without_line(grid, line_id)?;
            check_islands(grid, line_id, contingency.effect, mapping)?;
            mapping
        }
        _ => base,
    };
    let (recourse, lost_generation) = match contingency.effect {
        LineOutageEffect::DisconnectsLoad(d) => (
            add_load_recourse(program, grid, generation, &mut injections, d),
            None,
        ),
        LineOutageEffect::DisconnectsGenerator(g) => (
            add_generator_recourse(
                program,
                grid,
                generation,
                &mut injections,
                g,
            ),
            Some(generation[g]),
        ),
        LineOutageEffect::None => (vec![], None),
    };
    let flow_rows =
        add_flow_rows(program, mapping, &injections, settings.emergency_rating);
    Ok(ContingencyAccessors {
        kind: contingency.kind,
        label: contingency.label.clone(),
        recourse,
        lost_generation,
        flow_rows,
    })
}
