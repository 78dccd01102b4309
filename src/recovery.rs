//! Flow recovery services: physical voltages or line flows from fixed
//! setpoints, and the Monte Carlo verification built on them.

use crate::feeder::Feeder;
use crate::grid::FlowMapping;
use crate::risk;
use rayon::prelude::*;
use serde::Serialize;

/// Net active and reactive injection per bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusInjections {
    pub active: Vec<f64>,
    pub reactive: Vec<f64>,
}

impl BusInjections {
    pub fn zeros(num_buses: usize) -> Self {
        Self {
            active: vec![0.0; num_buses],
            reactive: vec![0.0; num_buses],
        }
    }
}

/// Recovered quantities (voltage magnitudes or line flows) and whether they
/// are physically realizable.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub values: Vec<f64>,
    pub success: bool,
}

pub trait FlowRecovery: Sync {
    fn recover(&self, injections: &BusInjections) -> Recovered;
}

/// Backward/forward sweep of the full DistFlow equations on a radial
/// feeder. Succeeds when the sweep converges to finite positive voltages.
#[derive(Debug, Clone)]
pub struct DistFlowSweep<'a> {
    feeder: &'a Feeder,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl<'a> DistFlowSweep<'a> {
    pub fn new(feeder: &'a Feeder) -> Self {
        Self {
            feeder,
            tolerance: 1e-8,
            max_iterations: 50,
        }
    }
}

impl FlowRecovery for DistFlowSweep<'_> {
    fn recover(&self, injections: &BusInjections) -> Recovered {
        let feeder = self.feeder;
        let n = feeder.num_buses();
        let mut v = vec![feeder.substation_voltage.powi(2); n];
        // branch quantities are stored at the receiving bus
        let mut p_flow = vec![0.0; n];
        let mut q_flow = vec![0.0; n];
        let mut losses = vec![0.0; n];
        let mut converged = false;

        for _ in 0..self.max_iterations {
            let mut downstream_p: Vec<f64> =
                injections.active.iter().map(|p| -p).collect();
            let mut downstream_q: Vec<f64> =
                injections.reactive.iter().map(|q| -q).collect();
            for &bus in feeder.order.iter().rev() {
                let (Some(index), Some(parent)) =
                    (feeder.parent_branch[bus], feeder.parent_bus(bus))
                else {
                    continue;
                };
                let branch = &feeder.branches[index];
                p_flow[bus] =
                    downstream_p[bus] + branch.resistance * losses[bus];
                q_flow[bus] =
                    downstream_q[bus] + branch.reactance * losses[bus];
                downstream_p[parent] += p_flow[bus];
                downstream_q[parent] += q_flow[bus];
            }

            let mut max_change: f64 = 0.0;
            for &bus in feeder.order.iter() {
                let (Some(index), Some(parent)) =
                    (feeder.parent_branch[bus], feeder.parent_bus(bus))
                else {
                    continue;
                };
                let branch = &feeder.branches[index];
                let r = branch.resistance;
                let x = branch.reactance;
                let updated = v[parent]
                    - 2.0 * (r * p_flow[bus] + x * q_flow[bus])
                    + (r * r + x * x) * losses[bus];
                max_change = max_change.max((updated - v[bus]).abs());
                v[bus] = updated;
                losses[bus] =
                    (p_flow[bus].powi(2) + q_flow[bus].powi(2)) / v[parent];
            }

            if !max_change.is_finite() {
                break;
            }
            if max_change < self.tolerance {
                converged = true;
                break;
            }
        }

        let success =
            converged && v.iter().all(|vj| vj.is_finite() && *vj > 0.0);
        Recovered {
            values: v.iter().map(|vj| vj.sqrt()).collect(),
            success,
        }
    }
}

/// DC line flows through a fixed PTDF mapping.
#[derive(Debug, Clone)]
pub struct DcFlow<'a> {
    mapping: &'a FlowMapping,
}

impl<'a> DcFlow<'a> {
    pub fn new(mapping: &'a FlowMapping) -> Self {
        Self { mapping }
    }
}

impl FlowRecovery for DcFlow<'_> {
    fn recover(&self, injections: &BusInjections) -> Recovered {
        let values = self.mapping.flows(&injections.active);
        let success = values.iter().all(|f| f.is_finite());
        Recovered { values, success }
    }
}

/// Out-of-sample check of one decision against unseen realizations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationSummary {
    pub samples: usize,
    pub recovery_failures: usize,
    pub violating_samples: usize,
    pub worst_violation: f64,
    /// Empirical CVaR of the worst signed limit margin of each recovered
    /// sample (positive margins are violations)
    pub margin_cvar: f64,
}

impl VerificationSummary {
    pub fn violation_rate(&self) -> f64 {
        let recovered = self.samples - self.recovery_failures;
        if recovered == 0 {
            return 0.0;
        }
        self.violating_samples as f64 / recovered as f64
    }
}

/// Largest signed distance of `values` outside `[lower, upper]`. Negative
/// when every value is strictly inside its band.
fn worst_margin(values: &[f64], lower: &[f64], upper: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values
        .iter()
        .zip(lower.iter().zip(upper.iter()))
        .map(|(value, (lo, up))| (lo - value).max(value - up))
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Recovers every sample in parallel and checks the values against
/// `[lower, upper]`. Recovery failures are counted and skipped.
pub fn monte_carlo<R: FlowRecovery + ?Sized>(
    recovery: &R,
    samples: &[BusInjections],
    lower: &[f64],
    upper: &[f64],
    alpha: f64,
) -> VerificationSummary {
    let margins: Vec<Option<f64>> = samples
        .par_iter()
        .map(|sample| {
            let recovered = recovery.recover(sample);
            if recovered.success {
                Some(worst_margin(&recovered.values, lower, upper))
            } else {
                None
            }
        })
        .collect();
    let recovered: Vec<f64> = margins.iter().flatten().copied().collect();
    VerificationSummary {
        samples: samples.len(),
        recovery_failures: samples.len() - recovered.len(),
        violating_samples: recovered.iter().filter(|m| **m > 0.0).count(),
        worst_violation: recovered.iter().fold(0.0, |w, m| m.max(w)),
        margin_cvar: risk::empirical_cvar(&recovered, alpha),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::tests::small_feeder;

    #[test]
    fn test_sweep_without_injections_is_flat() {
        let feeder = small_feeder();
        let recovered =
            DistFlowSweep::new(&feeder).recover(&BusInjections::zeros(4));
        assert!(recovered.success);
        assert!(recovered.values.iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_sweep_close_to_linearisation_for_light_loads() {
        let feeder = small_feeder();
        let injections = BusInjections {
            active: vec![0.0, -0.2, -0.1, -0.15],
            reactive: vec![0.0, -0.05, -0.02, -0.03],
        };
        let recovered = DistFlowSweep::new(&feeder).recover(&injections);
        assert!(recovered.success);
        let linear =
            feeder.squared_voltages(&injections.active, &injections.reactive);
        for (v, lin) in recovered.values.iter().zip(linear.iter()) {
            assert!((v * v - lin).abs() < 1e-3);
            assert!(*v <= 1.0);
        }
    }

    #[test]
    fn test_sweep_fails_for_unrealizable_load() {
        let feeder = small_feeder();
        let injections = BusInjections {
            active: vec![0.0, 0.0, -100.0, 0.0],
            reactive: vec![0.0; 4],
        };
        assert!(!DistFlowSweep::new(&feeder).recover(&injections).success);
    }

    struct Scripted;

    impl FlowRecovery for Scripted {
        fn recover(&self, injections: &BusInjections) -> Recovered {
            Recovered {
                values: injections.active.clone(),
                success: injections.reactive[0] >= 0.0,
            }
        }
    }

    #[test]
    fn test_monte_carlo_counts_failures_and_violations() {
        let sample = |p: f64, ok: bool| BusInjections {
            active: vec![p],
            reactive: vec![if ok { 0.0 } else { -1.0 }],
        };
        let samples = vec![
            sample(0.5, true),
            sample(1.5, true),
            sample(-0.25, true),
            sample(9.0, false),
        ];
        let summary = monte_carlo(&Scripted, &samples, &[0.0], &[1.0], 0.5);
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.recovery_failures, 1);
        assert_eq!(summary.violating_samples, 2);
        assert!((summary.worst_violation - 0.5).abs() < 1e-12);
        assert!((summary.violation_rate() - 2.0 / 3.0).abs() < 1e-12);
        // margins of the recovered samples: -0.5, 0.5 and 0.25
        let expected = risk::empirical_cvar(&[-0.5, 0.5, 0.25], 0.5);
        assert!((summary.margin_cvar - expected).abs() < 1e-12);
    }

    #[test]
    fn test_monte_carlo_margin_cvar_is_zero_inside_limits() {
        let samples: Vec<BusInjections> = [0.2, 0.4, 0.6]
            .iter()
            .map(|p| BusInjections {
                active: vec![*p],
                reactive: vec![0.0],
            })
            .collect();
        let summary = monte_carlo(&Scripted, &samples, &[0.0], &[1.0], 0.1);
        assert_eq!(summary.violating_samples, 0);
        assert_eq!(summary.worst_violation, 0.0);
        assert_eq!(summary.margin_cvar, 0.0);
    }
}
