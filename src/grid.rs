//! Meshed transmission grid under the DC approximation.
//!
//! Line flows follow bus injections through the power transfer distribution
//! factors
//!
//! ```text
//! PTDF[l][n] = (X[i][n] - X[j][n]) / x_l,   X = B'^-1
//! ```
//!
//! where line `l` joins buses `i` and `j` and `B'` is the susceptance
//! matrix with the slack row and column removed.

use nalgebra::DMatrix;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("{element} {id} refers to unknown bus {bus}")]
    UnknownBus {
        element: &'static str,
        id: usize,
        bus: usize,
    },
    #[error("line {0} does not exist")]
    UnknownLine(usize),
    #[error("line {0} has a non-positive reactance")]
    InvalidReactance(usize),
    #[error("line {0} has a non-positive flow limit")]
    InvalidLimit(usize),
    #[error("generator {0} has inconsistent output limits")]
    InvalidGenerator(usize),
    #[error("the susceptance matrix is singular")]
    SingularSusceptance,
    #[error(
        "removing line {line} islands bus {bus}, which carries injections the \
         outage table does not cover"
    )]
    UnhandledIsland { line: usize, bus: usize },
}

#[derive(Debug, Clone)]
pub struct TransmissionLine {
    pub id: usize,
    pub from_bus: usize,
    pub to_bus: usize,
    pub reactance: f64,
    pub limit: f64,
}

impl TransmissionLine {
    pub fn new(
        id: usize,
        from_bus: usize,
        to_bus: usize,
        reactance: f64,
        limit: f64,
    ) -> Self {
        Self {
            id,
            from_bus,
            to_bus,
            reactance,
            limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generator {
    pub id: usize,
    pub bus_id: usize,
    pub cost: f64,
    pub min_output: f64,
    pub max_output: f64,
}

impl Generator {
    pub fn new(
        id: usize,
        bus_id: usize,
        cost: f64,
        min_output: f64,
        max_output: f64,
    ) -> Self {
        Self {
            id,
            bus_id,
            cost,
            min_output,
            max_output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Load {
    pub id: usize,
    pub bus_id: usize,
    pub demand: f64,
}

impl Load {
    pub fn new(id: usize, bus_id: usize, demand: f64) -> Self {
        Self { id, bus_id, demand }
    }
}

#[derive(Debug, Clone)]
pub struct WindFarm {
    pub id: usize,
    pub bus_id: usize,
    pub capacity: f64,
    pub forecast: f64,
}

impl WindFarm {
    pub fn new(id: usize, bus_id: usize, capacity: f64, forecast: f64) -> Self {
        Self {
            id,
            bus_id,
            capacity,
            forecast,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    pub num_buses: usize,
    pub slack_bus: usize,
    pub lines: Vec<TransmissionLine>,
    pub generators: Vec<Generator>,
    pub loads: Vec<Load>,
    pub wind_farms: Vec<WindFarm>,
}

impl Grid {
    pub fn new(
        num_buses: usize,
        slack_bus: usize,
        lines: Vec<TransmissionLine>,
        generators: Vec<Generator>,
        loads: Vec<Load>,
        wind_farms: Vec<WindFarm>,
    ) -> Result<Self, GridError> {
        let check = |element: &'static str, id: usize, bus: usize| {
            if bus >= num_buses {
                Err(GridError::UnknownBus { element, id, bus })
            } else {
                Ok(())
            }
        };
        check("slack", 0, slack_bus)?;
        for l in lines.iter() {
            check("line", l.id, l.from_bus)?;
            check("line", l.id, l.to_bus)?;
            if !(l.reactance > 0.0) {
                return Err(GridError::InvalidReactance(l.id));
            }
            if !(l.limit > 0.0) {
                return Err(GridError::InvalidLimit(l.id));
            }
        }
        for g in generators.iter() {
            check("generator", g.id, g.bus_id)?;
            if !(g.min_output <= g.max_output) {
                return Err(GridError::InvalidGenerator(g.id));
            }
        }
        for d in loads.iter() {
            check("load", d.id, d.bus_id)?;
        }
        for w in wind_farms.iter() {
            check("wind farm", w.id, w.bus_id)?;
        }
        Ok(Self {
            num_buses,
            slack_bus,
            lines,
            generators,
            loads,
            wind_farms,
        })
    }

    pub fn all_lines(&self) -> Vec<usize> {
        (0..self.lines.len()).collect()
    }

    pub fn total_demand(&self) -> f64 {
        self.loads.iter().map(|d| d.demand).sum()
    }

    pub fn bus_demand(&self, bus: usize) -> f64 {
        self.loads
            .iter()
            .filter(|d| d.bus_id == bus)
            .map(|d| d.demand)
            .sum()
    }

    /// Whether any generator, load or wind farm sits at `bus`.
    pub fn has_injections(&self, bus: usize) -> bool {
        self.generators.iter().any(|g| g.bus_id == bus)
            || self.loads.iter().any(|d| d.bus_id == bus)
            || self.wind_farms.iter().any(|w| w.bus_id == bus)
    }
}

/// PTDF of a set of in-service lines. Columns always span every bus of the
/// grid; buses cut off from the slack have zero columns.
#[derive(Debug, Clone)]
pub struct FlowMapping {
    /// Original ids of the in-service lines, one per row
    pub line_ids: Vec<usize>,
    /// Flow limits of the in-service lines, one per row
    pub limits: Vec<f64>,
    /// Buses not connected to the slack bus
    pub islanded_buses: Vec<usize>,
    ptdf: DMatrix<f64>,
}

impl FlowMapping {
    pub fn num_lines(&self) -> usize {
        self.line_ids.len()
    }

    pub fn factor(&self, row: usize, bus: usize) -> f64 {
        self.ptdf[(row, bus)]
    }

    /// Row of line `line_id`, if the line is in service.
    pub fn row_of(&self, line_id: usize) -> Option<usize> {
        self.line_ids.iter().position(|l| *l == line_id)
    }

    pub fn flows(&self, injections: &[f64]) -> Vec<f64> {
        (0..self.num_lines())
            .map(|row| {
                injections
                    .iter()
                    .enumerate()
                    .map(|(bus, p)| self.ptdf[(row, bus)] * p)
                    .sum()
            })
            .collect()
    }
}

/// Rebuilds the PTDF for the lines in `retained_lines`. Bus numbering is
/// never changed; only the line set shrinks.
pub fn flow_mapping(
    grid: &Grid,
    retained_lines: &[usize],
) -> Result<FlowMapping, GridError> {
    let n = grid.num_buses;
    let mut lines =
        Vec::<&TransmissionLine>::with_capacity(retained_lines.len());
    for id in retained_lines.iter() {
        lines.push(grid.lines.get(*id).ok_or(GridError::UnknownLine(*id))?);
    }

    // buses reachable from the slack through the retained lines
    let mut adjacency = vec![Vec::<usize>::new(); n];
    for l in lines.iter() {
        adjacency[l.from_bus].push(l.to_bus);
        adjacency[l.to_bus].push(l.from_bus);
    }
    let mut connected = vec![false; n];
    connected[grid.slack_bus] = true;
    let mut queue = VecDeque::from([grid.slack_bus]);
    while let Some(bus) = queue.pop_front() {
        for &other in adjacency[bus].iter() {
            if !connected[other] {
                connected[other] = true;
                queue.push_back(other);
            }
        }
    }

    // reduced index of every connected non-slack bus
    let mut reduced = vec![None; n];
    let mut size = 0;
    for bus in 0..n {
        if connected[bus] && bus != grid.slack_bus {
            reduced[bus] = Some(size);
            size += 1;
        }
    }

    let mut x = DMatrix::<f64>::zeros(n, n);
    if size > 0 {
        let mut b = DMatrix::<f64>::zeros(size, size);
        for l in lines.iter() {
            let susceptance = 1.0 / l.reactance;
            let (i, j) = (reduced[l.from_bus], reduced[l.to_bus]);
            if let Some(i) = i {
                b[(i, i)] += susceptance;
            }
            if let Some(j) = j {
                b[(j, j)] += susceptance;
            }
            if let (Some(i), Some(j)) = (i, j) {
                b[(i, j)] -= susceptance;
                b[(j, i)] -= susceptance;
            }
        }
        let inverse = b.try_inverse().ok_or(GridError::SingularSusceptance)?;
        for bus_i in 0..n {
            let Some(i) = reduced[bus_i] else { continue };
            for bus_j in 0..n {
                if let Some(j) = reduced[bus_j] {
                    x[(bus_i, bus_j)] = inverse[(i, j)];
                }
            }
        }
    }

    let mut ptdf = DMatrix::<f64>::zeros(lines.len(), n);
    for (row, l) in lines.iter().enumerate() {
        if !connected[l.from_bus] || !connected[l.to_bus] {
            continue;
        }
        for bus in 0..n {
            let difference = x[(l.from_bus, bus)] - x[(l.to_bus, bus)];
            ptdf[(row, bus)] = difference / l.reactance;
        }
    }

    Ok(FlowMapping {
        line_ids: lines.iter().map(|l| l.id).collect(),
        limits: lines.iter().map(|l| l.limit).collect(),
        islanded_buses: (0..n).filter(|bus| !connected[*bus]).collect(),
        ptdf,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Triangle 0-1-2 with a radial spur 2-3. Generators at buses 0 and 1,
    /// loads at 2 and 3, one wind farm at bus 1.
    pub fn small_grid() -> Grid {
        let lines = vec![
            TransmissionLine::new(0, 0, 1, 0.1, 100.0),
            TransmissionLine::new(1, 1, 2, 0.1, 100.0),
            TransmissionLine::new(2, 0, 2, 0.1, 100.0),
            TransmissionLine::new(3, 2, 3, 0.05, 100.0),
        ];
        let generators = vec![
            Generator::new(0, 0, 10.0, 0.0, 80.0),
            Generator::new(1, 1, 20.0, 0.0, 80.0),
        ];
        let loads = vec![Load::new(0, 2, 40.0), Load::new(1, 3, 25.0)];
        let wind_farms = vec![WindFarm::new(0, 1, 30.0, 15.0)];
        Grid::new(4, 0, lines, generators, loads, wind_farms).unwrap()
    }

    #[test]
    fn test_triangle_transfer_split() {
        let grid = small_grid();
        let mapping = flow_mapping(&grid, &grid.all_lines()).unwrap();
        // one unit from bus 1 to bus 2: two thirds on the direct line
        let flows = mapping.flows(&[0.0, 1.0, -1.0, 0.0]);
        assert!((flows[1] - 2.0 / 3.0).abs() < 1e-12);
        assert!((flows[0] + 1.0 / 3.0).abs() < 1e-12);
        assert!((flows[2] - 1.0 / 3.0).abs() < 1e-12);
        assert!(flows[3].abs() < 1e-12);
        // the slack column is zero
        assert!((0..4).all(|row| mapping.factor(row, 0) == 0.0));
    }

    #[test]
    fn test_line_removal_keeps_bus_numbering() {
        let grid = small_grid();
        let mapping = flow_mapping(&grid, &[0, 2, 3]).unwrap();
        assert_eq!(mapping.line_ids, vec![0, 2, 3]);
        assert_eq!(mapping.row_of(3), Some(2));
        assert_eq!(mapping.row_of(1), None);
        let flows = mapping.flows(&[0.0, 1.0, -1.0, 0.0]);
        // everything now goes 1 -> 0 -> 2
        assert!((flows[0] + 1.0).abs() < 1e-12);
        assert!((flows[1] - 1.0).abs() < 1e-12);
        assert!(mapping.islanded_buses.is_empty());
    }

    #[test]
    fn test_radial_outage_islands_bus() {
        let grid = small_grid();
        let mapping = flow_mapping(&grid, &[0, 1, 2]).unwrap();
        assert_eq!(mapping.islanded_buses, vec![3]);
        assert!((0..3).all(|row| mapping.factor(row, 3) == 0.0));
        assert_eq!(mapping.limits.len(), 3);
    }

    #[test]
    fn test_invalid_elements_are_rejected() {
        let err = Grid::new(
            2,
            0,
            vec![TransmissionLine::new(0, 0, 1, 0.0, 10.0)],
            vec![],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, GridError::InvalidReactance(0));
        let grid = small_grid();
        assert_eq!(
            flow_mapping(&grid, &[7]).unwrap_err(),
            GridError::UnknownLine(7)
        );
    }
}
