use crate::contingency::ContingencyReport;
use crate::recovery::VerificationSummary;
use crate::risk::{ConstraintKind, CvarBreakdown};
use crate::solver::SolveStatus;

use csv::Writer;
use serde;
use std::error::Error;

/// Value of one scheduled quantity, named after its entity.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScheduleEntry {
    pub entity: String,
    pub value: f64,
}

impl ScheduleEntry {
    pub fn new(entity: String, value: f64) -> Self {
        Self { entity, value }
    }
}

/// Outcome of one solve of a sweep. `position` is the epoch for the MPC
/// sweep and the radius index for the transmission sweep.
#[derive(Debug, Clone)]
pub struct ArchivedRecord {
    pub risk_index: usize,
    pub position: usize,
    pub risk_weight: f64,
    pub epsilon: f64,
    pub status: SolveStatus,
    pub retries: usize,
    pub objective: Option<f64>,
    pub operating_cost: Option<f64>,
    pub cvar: Vec<CvarBreakdown>,
    pub schedule: Vec<ScheduleEntry>,
    pub contingencies: Vec<ContingencyReport>,
    pub verification: Option<VerificationSummary>,
}

impl ArchivedRecord {
    /// Record of a solve that produced no trusted primal values.
    pub fn flagged(
        risk_index: usize,
        position: usize,
        risk_weight: f64,
        epsilon: f64,
        status: SolveStatus,
        retries: usize,
    ) -> Self {
        Self {
            risk_index,
            position,
            risk_weight,
            epsilon,
            status,
            retries,
            objective: None,
            operating_cost: None,
            cvar: vec![],
            schedule: vec![],
            contingencies: vec![],
            verification: None,
        }
    }

    pub fn total_cvar(&self) -> f64 {
        self.cvar.iter().map(|c| c.cvar).sum()
    }

    pub fn scheduled(&self, entity: &str) -> Option<f64> {
        self.schedule
            .iter()
            .find(|e| e.entity == entity)
            .map(|e| e.value)
    }
}

/// Append-only archive keyed by `(risk_index, position)`.
#[derive(Debug, Default)]
pub struct ResultStore {
    records: Vec<ArchivedRecord>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `record`, refusing a key that is already archived.
    pub fn push(&mut self, record: ArchivedRecord) -> bool {
        if self.get(record.risk_index, record.position).is_some() {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn get(
        &self,
        risk_index: usize,
        position: usize,
    ) -> Option<&ArchivedRecord> {
        self.records
            .iter()
            .find(|r| r.risk_index == risk_index && r.position == position)
    }

    pub fn records(&self) -> &[ArchivedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count_status(&self, status: SolveStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

#[derive(serde::Serialize)]
struct SummaryOutput {
    risk_index: usize,
    position: usize,
    risk_weight: f64,
    epsilon: f64,
    status: SolveStatus,
    retries: usize,
    objective: Option<f64>,
    operating_cost: Option<f64>,
    total_cvar: f64,
    verification_samples: Option<usize>,
    recovery_failures: Option<usize>,
    violating_samples: Option<usize>,
    worst_violation: Option<f64>,
    margin_cvar: Option<f64>,
    violation_rate: Option<f64>,
}

fn write_summary(
    store: &ResultStore,
    path: &str,
) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_path(&(path.to_owned() + "/summary.csv"))?;
    for r in store.records() {
        let v = r.verification.as_ref();
        wtr.serialize(SummaryOutput {
            risk_index: r.risk_index,
            position: r.position,
            risk_weight: r.risk_weight,
            epsilon: r.epsilon,
            status: r.status,
            retries: r.retries,
            objective: r.objective,
            operating_cost: r.operating_cost,
            total_cvar: r.total_cvar(),
            verification_samples: v.map(|v| v.samples),
            recovery_failures: v.map(|v| v.recovery_failures),
            violating_samples: v.map(|v| v.violating_samples),
            worst_violation: v.map(|v| v.worst_violation),
            margin_cvar: v.map(|v| v.margin_cvar),
            violation_rate: v.map(|v| v.violation_rate()),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(serde::Serialize)]
struct CvarOutput<'a> {
    risk_index: usize,
    position: usize,
    label: &'a str,
    kind: ConstraintKind,
    contribution: f64,
    cvar: f64,
    value_at_risk: f64,
    dual_norm: f64,
}

fn write_cvar(store: &ResultStore, path: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_path(&(path.to_owned() + "/cvar.csv"))?;
    for r in store.records() {
        for c in r.cvar.iter() {
            wtr.serialize(CvarOutput {
                risk_index: r.risk_index,
                position: r.position,
                label: &c.label,
                kind: c.kind,
                contribution: c.contribution,
                cvar: c.cvar,
                value_at_risk: c.value_at_risk,
                dual_norm: c.dual_norm,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[derive(serde::Serialize)]
struct ScheduleOutput<'a> {
    risk_index: usize,
    position: usize,
    entity: &'a str,
    value: f64,
}

fn write_schedule(
    store: &ResultStore,
    path: &str,
) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_path(&(path.to_owned() + "/schedule.csv"))?;
    for r in store.records() {
        for e in r.schedule.iter() {
            wtr.serialize(ScheduleOutput {
                risk_index: r.risk_index,
                position: r.position,
                entity: &e.entity,
                value: e.value,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[derive(serde::Serialize)]
struct ContingencyOutput<'a> {
    risk_index: usize,
    position: usize,
    label: &'a str,
    recourse_sum: f64,
    expected_sum: f64,
}

fn write_contingencies(
    store: &ResultStore,
    path: &str,
) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_path(&(path.to_owned() + "/contingencies.csv"))?;
    for r in store.records() {
        for c in r.contingencies.iter() {
            wtr.serialize(ContingencyOutput {
                risk_index: r.risk_index,
                position: r.position,
                label: &c.label,
                recourse_sum: c.recourse_sum,
                expected_sum: c.expected_sum,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn generate_outputs(
    store: &ResultStore,
    path: &str,
) -> Result<(), Box<dyn Error>> {
    write_summary(store, path)?;
    write_cvar(store, path)?;
    write_schedule(store, path)?;
    write_contingencies(store, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(risk_index: usize, position: usize) -> ArchivedRecord {
        let mut r = ArchivedRecord::flagged(
            risk_index,
            position,
            1.0,
            0.0,
            SolveStatus::Optimal,
            0,
        );
        r.objective = Some(3.0);
        r.operating_cost = Some(2.5);
        r.cvar.push(CvarBreakdown {
            label: "v_upper[b1,h0]".to_string(),
            kind: ConstraintKind::VoltageUpper,
            contribution: 0.5,
            cvar: 0.5,
            value_at_risk: -0.1,
            dual_norm: 0.0,
        });
        r.schedule
            .push(ScheduleEntry::new("curtailment[pv0,h0]".to_string(), 0.2));
        r
    }

    #[test]
    fn test_store_is_keyed_and_append_only() {
        let mut store = ResultStore::new();
        assert!(store.push(record(0, 0)));
        assert!(store.push(record(0, 1)));
        assert!(!store.push(record(0, 1)));
        assert_eq!(store.len(), 2);
        let record = store.get(0, 1).unwrap();
        assert_eq!(record.scheduled("curtailment[pv0,h0]"), Some(0.2));
        assert!(store.get(1, 0).is_none());
        assert_eq!(store.count_status(SolveStatus::Optimal), 2);
    }

    #[test]
    fn test_write_outputs() {
        let mut store = ResultStore::new();
        store.push(record(0, 0));
        store.push(ArchivedRecord::flagged(
            1,
            0,
            10.0,
            0.0,
            SolveStatus::Infeasible,
            4,
        ));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        generate_outputs(&store, path).unwrap();

        let mut rdr =
            csv::Reader::from_path(dir.path().join("summary.csv")).unwrap();
        let rows: Vec<csv::StringRecord> =
            rdr.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][4], "Infeasible");
        assert_eq!(&rows[1][6], "");
        let headers = rdr.headers().unwrap();
        assert!(headers.iter().any(|h| h == "margin_cvar"));
        assert!(headers.iter().any(|h| h == "violation_rate"));

        let mut rdr =
            csv::Reader::from_path(dir.path().join("cvar.csv")).unwrap();
        assert_eq!(rdr.records().count(), 1);
        assert!(dir.path().join("contingencies.csv").exists());
    }
}
