//! Step weight tables and the weighted progress formula.
//!
//! Every workflow type has a fixed table of step weights summing to 100. The
//! overall progress is `round(Σ weight × percent / Σ weight)`; steps missing
//! from the table are tracked but weigh nothing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::errors::{JobError, JobResult};
use super::task::TaskType;
use super::workflow::StepProgress;

/// Weights that every table must add up to.
pub const TOTAL_WEIGHT: u32 = 100;

/// Step weights for one workflow type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, u32>", into = "BTreeMap<String, u32>")]
pub struct WeightTable {
    weights: BTreeMap<String, u32>,
}

impl WeightTable {
    pub fn new<I, S>(weights: I) -> JobResult<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let weights: BTreeMap<String, u32> =
            weights.into_iter().map(|(s, w)| (s.into(), w)).collect();
        if weights.is_empty() {
            return Err(JobError::Config("weight table has no steps".to_string()));
        }
        if let Some((step, _)) = weights.iter().find(|(_, w)| **w == 0) {
            return Err(JobError::Config(format!("step {step:?} has zero weight")));
        }
        let sum: u32 = weights.values().sum();
        if sum != TOTAL_WEIGHT {
            return Err(JobError::Config(format!(
                "step weights sum to {sum}, expected {TOTAL_WEIGHT}"
            )));
        }
        Ok(Self { weights })
    }

    pub fn weight(&self, step: &str) -> u32 {
        self.weights.get(step).copied().unwrap_or(0)
    }

    pub fn steps(&self) -> impl Iterator<Item = (&str, u32)> {
        self.weights.iter().map(|(s, w)| (s.as_str(), *w))
    }

    /// Weighted aggregate of the reported steps, rounded half away from zero.
    pub fn estimate(&self, steps: &BTreeMap<String, StepProgress>) -> u8 {
        let total: u32 = self.weights.values().sum();
        let weighted: u32 = steps
            .iter()
            .map(|(name, p)| self.weight(name) * u32::from(p.percent_complete.min(100)))
            .sum();
        let estimate = (f64::from(weighted) / f64::from(total)).round();
        estimate.clamp(0.0, 100.0) as u8
    }
}

impl TryFrom<BTreeMap<String, u32>> for WeightTable {
    type Error = JobError;

    fn try_from(weights: BTreeMap<String, u32>) -> Result<Self, Self::Error> {
        Self::new(weights)
    }
}

impl From<WeightTable> for BTreeMap<String, u32> {
    fn from(table: WeightTable) -> Self {
        table.weights
    }
}

/// Weight tables for every known workflow type.
///
/// Tables are validated when the registry is built, so a bad table fails at
/// startup rather than on the first progress callback.
#[derive(Debug, Clone)]
pub struct WeightRegistry {
    tables: HashMap<TaskType, WeightTable>,
}

impl WeightRegistry {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    /// Tables for the workflow types the backend ships with.
    pub fn builtin() -> JobResult<Self> {
        let mut registry = Self::new();
        registry.insert(
            TaskType::new(TaskType::AUDIO_PROCESSING),
            WeightTable::new([
                ("download", 10),
                ("encode", 20),
                ("transcribe", 30),
                ("summarize", 25),
                ("publish", 15),
            ])?,
        );
        registry.insert(
            TaskType::new(TaskType::TRANSCRIPTION),
            WeightTable::new([("download", 20), ("transcribe", 70), ("store", 10)])?,
        );
        registry.insert(
            TaskType::new(TaskType::IMPORT_SHOW),
            WeightTable::new([
                ("fetch-feed", 20),
                ("parse-feed", 10),
                ("import-episodes", 60),
                ("finalize", 10),
            ])?,
        );
        Ok(registry)
    }

    /// Add or replace the table for a workflow type.
    pub fn insert(&mut self, workflow_type: TaskType, table: WeightTable) {
        self.tables.insert(workflow_type, table);
    }

    pub fn get(&self, workflow_type: &TaskType) -> Option<&WeightTable> {
        self.tables.get(workflow_type)
    }

    pub fn contains(&self, workflow_type: &TaskType) -> bool {
        self.tables.contains_key(workflow_type)
    }
}

impl Default for WeightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn steps(entries: &[(&str, u8)]) -> BTreeMap<String, StepProgress> {
        entries
            .iter()
            .map(|(name, pct)| {
                (
                    name.to_string(),
                    StepProgress {
                        percent_complete: *pct,
                        message: None,
                        updated_at: Utc::now(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn two_step_weighted_example() {
        let table = WeightTable::new([("a", 40), ("b", 60)]).unwrap();
        assert_eq!(table.estimate(&steps(&[("a", 100), ("b", 50)])), 70);
    }

    #[test]
    fn unreported_steps_count_as_zero() {
        let table = WeightTable::new([("a", 40), ("b", 60)]).unwrap();
        assert_eq!(table.estimate(&steps(&[("b", 100)])), 60);
        assert_eq!(table.estimate(&BTreeMap::new()), 0);
    }

    #[test]
    fn unknown_steps_weigh_nothing() {
        let table = WeightTable::new([("a", 40), ("b", 60)]).unwrap();
        assert_eq!(table.estimate(&steps(&[("a", 100), ("thumbnail", 100)])), 40);
    }

    #[test]
    fn rounds_half_up() {
        let table = WeightTable::new([("a", 50), ("b", 50)]).unwrap();
        // 50 * 1 / 100 = 0.5
        assert_eq!(table.estimate(&steps(&[("a", 1)])), 1);
        let table = WeightTable::new([("a", 30), ("b", 70)]).unwrap();
        // (30 * 33) / 100 = 9.9
        assert_eq!(table.estimate(&steps(&[("a", 33)])), 10);
    }

    #[rstest]
    #[case::short(vec![("a", 40), ("b", 50)])]
    #[case::over(vec![("a", 40), ("b", 70)])]
    #[case::zero_weight(vec![("a", 100), ("b", 0)])]
    #[case::empty(vec![])]
    fn invalid_tables_are_rejected(#[case] weights: Vec<(&str, u32)>) {
        assert!(matches!(WeightTable::new(weights), Err(JobError::Config(_))));
    }

    #[test]
    fn builtin_tables_are_valid() {
        let registry = WeightRegistry::builtin().unwrap();
        let audio = registry
            .get(&TaskType::new(TaskType::AUDIO_PROCESSING))
            .unwrap();
        assert_eq!(audio.weight("transcribe"), 30);
        assert_eq!(audio.weight("encode"), 20);
        assert!(registry.contains(&TaskType::new(TaskType::IMPORT_SHOW)));
    }

    #[test]
    fn tables_deserialize_with_validation() {
        let ok: WeightTable = serde_json::from_str(r#"{"fetch": 25, "render": 75}"#).unwrap();
        assert_eq!(ok.weight("render"), 75);
        assert!(serde_json::from_str::<WeightTable>(r#"{"fetch": 25}"#).is_err());
    }
}
