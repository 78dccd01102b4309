//! Radial distribution feeder and its LinDistFlow voltage sensitivities.
//!
//! With squared voltage magnitudes `v` and net bus injections `(p, q)` the
//! linearised branch flow model gives
//!
//! ```text
//! v_j = v_0^2 + 2 Σ_m (R_jm p_m + X_jm q_m)
//! ```
//!
//! where `R_jm` (`X_jm`) is the resistance (reactance) of the path shared by
//! buses `j` and `m` back to the substation.

use crate::utils::hold_last;
use nalgebra::{DMatrix, DVector};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FeederError {
    #[error("feeder with {buses} buses needs {expected} branches, got {found}")]
    NotRadial {
        buses: usize,
        expected: usize,
        found: usize,
    },
    #[error("{element} {id} refers to unknown bus {bus}")]
    UnknownBus {
        element: &'static str,
        id: usize,
        bus: usize,
    },
    #[error("bus {0} is not connected to the substation")]
    DisconnectedBus(usize),
    #[error("branch {0} has an invalid impedance")]
    InvalidImpedance(usize),
    #[error("battery {0} has invalid parameters")]
    InvalidBattery(usize),
    #[error("invalid voltage limits [{0}, {1}]")]
    InvalidVoltageLimits(f64, f64),
}

#[derive(Debug, Clone)]
pub struct FeederBus {
    pub id: usize,
    pub active_load: Vec<f64>,
    pub reactive_load: Vec<f64>,
}

impl FeederBus {
    pub fn new(
        id: usize,
        active_load: Vec<f64>,
        reactive_load: Vec<f64>,
    ) -> Self {
        Self {
            id,
            active_load,
            reactive_load,
        }
    }

    pub fn active_load_at(&self, time: usize) -> f64 {
        hold_last(&self.active_load, time)
    }

    pub fn reactive_load_at(&self, time: usize) -> f64 {
        hold_last(&self.reactive_load, time)
    }
}

#[derive(Debug, Clone)]
pub struct FeederBranch {
    pub id: usize,
    pub from_bus: usize,
    pub to_bus: usize,
    pub resistance: f64,
    pub reactance: f64,
}

impl FeederBranch {
    pub fn new(
        id: usize,
        from_bus: usize,
        to_bus: usize,
        resistance: f64,
        reactance: f64,
    ) -> Self {
        Self {
            id,
            from_bus,
            to_bus,
            resistance,
            reactance,
        }
    }
}

/// Photovoltaic inverter. `capacity` bounds the available active power and
/// `apparent_rating` the inverter's apparent power.
#[derive(Debug, Clone)]
pub struct PvUnit {
    pub id: usize,
    pub bus_id: usize,
    pub capacity: f64,
    pub apparent_rating: f64,
}

impl PvUnit {
    pub fn new(
        id: usize,
        bus_id: usize,
        capacity: f64,
        apparent_rating: f64,
    ) -> Self {
        Self {
            id,
            bus_id,
            capacity,
            apparent_rating,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Battery {
    pub id: usize,
    pub bus_id: usize,
    pub max_power: f64,
    pub min_soc: f64,
    pub max_soc: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
}

impl Battery {
    pub fn new(
        id: usize,
        bus_id: usize,
        max_power: f64,
        min_soc: f64,
        max_soc: f64,
        charge_efficiency: f64,
        discharge_efficiency: f64,
    ) -> Self {
        Self {
            id,
            bus_id,
            max_power,
            min_soc,
            max_soc,
            charge_efficiency,
            discharge_efficiency,
        }
    }

    fn is_valid(&self) -> bool {
        let efficiency = |e: f64| e > 0.0 && e <= 1.0;
        self.max_power >= 0.0
            && self.min_soc >= 0.0
            && self.min_soc <= self.max_soc
            && efficiency(self.charge_efficiency)
            && efficiency(self.discharge_efficiency)
    }
}

#[derive(Debug, Clone)]
pub struct Feeder {
    pub buses: Vec<FeederBus>,
    pub branches: Vec<FeederBranch>,
    pub pvs: Vec<PvUnit>,
    pub batteries: Vec<Battery>,
    pub substation_voltage: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    /// Branch feeding each bus, `None` at the substation
    pub parent_branch: Vec<Option<usize>>,
    /// Buses in breadth-first order from the substation
    pub order: Vec<usize>,
    resistance: DMatrix<f64>,
    reactance: DMatrix<f64>,
}

impl Feeder {
    pub fn new(
        buses: Vec<FeederBus>,
        branches: Vec<FeederBranch>,
        pvs: Vec<PvUnit>,
        batteries: Vec<Battery>,
        substation_voltage: f64,
        min_voltage: f64,
        max_voltage: f64,
    ) -> Result<Self, FeederError> {
        let n = buses.len();
        if n == 0 || branches.len() != n - 1 {
            return Err(FeederError::NotRadial {
                buses: n,
                expected: n.saturating_sub(1),
                found: branches.len(),
            });
        }
        if !(min_voltage > 0.0 && min_voltage < max_voltage) {
            return Err(FeederError::InvalidVoltageLimits(
                min_voltage,
                max_voltage,
            ));
        }

        let mut adjacency = vec![Vec::<usize>::new(); n];
        for (index, b) in branches.iter().enumerate() {
            for bus in [b.from_bus, b.to_bus] {
                if bus >= n {
                    return Err(FeederError::UnknownBus {
                        element: "branch",
                        id: b.id,
                        bus,
                    });
                }
            }
            let valid = |z: f64| z.is_finite() && z >= 0.0;
            if !valid(b.resistance) || !valid(b.reactance) {
                return Err(FeederError::InvalidImpedance(b.id));
            }
            adjacency[b.from_bus].push(index);
            adjacency[b.to_bus].push(index);
        }
        for pv in pvs.iter() {
            if pv.bus_id >= n {
                return Err(FeederError::UnknownBus {
                    element: "pv",
                    id: pv.id,
                    bus: pv.bus_id,
                });
            }
        }
        for battery in batteries.iter() {
            if battery.bus_id >= n {
                return Err(FeederError::UnknownBus {
                    element: "battery",
                    id: battery.id,
                    bus: battery.bus_id,
                });
            }
            if !battery.is_valid() {
                return Err(FeederError::InvalidBattery(battery.id));
            }
        }

        // breadth-first orientation from the substation (bus 0)
        let mut parent_branch = vec![None; n];
        let mut visited = vec![false; n];
        let mut order = Vec::<usize>::with_capacity(n);
        let mut queue = VecDeque::from([0usize]);
        visited[0] = true;
        while let Some(bus) = queue.pop_front() {
            order.push(bus);
            for &index in adjacency[bus].iter() {
                let b = &branches[index];
                let other = if b.from_bus == bus {
                    b.to_bus
                } else {
                    b.from_bus
                };
                if !visited[other] {
                    visited[other] = true;
                    parent_branch[other] = Some(index);
                    queue.push_back(other);
                }
            }
        }
        if let Some(bus) = visited.iter().position(|v| !v) {
            return Err(FeederError::DisconnectedBus(bus));
        }

        // path incidence: paths[(b, j)] = 1 when branch b lies between bus j
        // and the substation
        let nb = branches.len();
        let mut paths = DMatrix::<f64>::zeros(nb, n);
        for j in 0..n {
            let mut bus = j;
            while let Some(index) = parent_branch[bus] {
                paths[(index, j)] = 1.0;
                let b = &branches[index];
                bus = if b.to_bus == bus { b.from_bus } else { b.to_bus };
            }
        }
        let r =
            DVector::from_iterator(nb, branches.iter().map(|b| b.resistance));
        let x =
            DVector::from_iterator(nb, branches.iter().map(|b| b.reactance));
        let incidence = paths.transpose();
        let resistance = &incidence * DMatrix::from_diagonal(&r) * &paths;
        let reactance = &incidence * DMatrix::from_diagonal(&x) * &paths;

        Ok(Self {
            buses,
            branches,
            pvs,
            batteries,
            substation_voltage,
            min_voltage,
            max_voltage,
            parent_branch,
            order,
            resistance,
            reactance,
        })
    }

    pub fn num_buses(&self) -> usize {
        self.buses.len()
    }

    /// Shared-path resistance between buses `j` and `m`.
    pub fn resistance_sensitivity(&self, j: usize, m: usize) -> f64 {
        self.resistance[(j, m)]
    }

    pub fn reactance_sensitivity(&self, j: usize, m: usize) -> f64 {
        self.reactance[(j, m)]
    }

    /// Upstream bus of `bus`, `None` at the substation.
    pub fn parent_bus(&self, bus: usize) -> Option<usize> {
        self.parent_branch[bus].map(|index| {
            let b = &self.branches[index];
            if b.to_bus == bus {
                b.from_bus
            } else {
                b.to_bus
            }
        })
    }

    /// Linearised squared voltages for net injections `(p, q)` per bus.
    pub fn squared_voltages(&self, p: &[f64], q: &[f64]) -> Vec<f64> {
        let v0 = self.substation_voltage.powi(2);
        (0..self.num_buses())
            .map(|j| {
                v0 + 2.0
                    * (0..self.num_buses())
                        .map(|m| {
                            self.resistance[(j, m)] * p[m]
                                + self.reactance[(j, m)] * q[m]
                        })
                        .sum::<f64>()
            })
            .collect()
    }
}
