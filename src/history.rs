//! Iteration history retained between solves for reporting.

use std::time::Duration;

use serde::Serialize;

/// Snapshot of solver progress after one main iteration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IterationRecord {
    /// Zero-based index of the main iteration.
    pub index: usize,
    /// Objective value after the iteration.
    pub objective: f64,
    /// Relative gap after the iteration.
    pub relative_gap: f64,
    /// Line-search trials spent during the iteration.
    pub line_searches: usize,
    /// Time elapsed since the solve started.
    pub elapsed: Duration,
}

/// Append-only sequence of [`IterationRecord`]s, cleared when a solve starts.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct IterationHistory {
    records: Vec<IterationRecord>,
}

impl IterationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: IterationRecord) {
        debug_assert!(
            self.records
                .last()
                .map_or(true, |last| last.index + 1 == record.index),
            "iteration records must be consecutive"
        );
        self.records.push(record);
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    /// Smallest relative gap seen so far.
    pub fn best_gap(&self) -> Option<f64> {
        self.records
            .iter()
            .map(|record| record.relative_gap)
            .min_by(f64::total_cmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, relative_gap: f64) -> IterationRecord {
        IterationRecord {
            index,
            objective: 1.0,
            relative_gap,
            line_searches: 1,
            elapsed: Duration::from_millis(index as u64),
        }
    }

    #[test]
    fn history_tracks_best_gap() {
        let mut history = IterationHistory::new();
        history.push(record(0, 0.3));
        history.push(record(1, 0.01));
        history.push(record(2, 0.02));
        assert_eq!(history.len(), 3);
        assert_eq!(history.best_gap(), Some(0.01));
        assert_eq!(history.last().map(|r| r.index), Some(2));

        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.best_gap(), None);
    }
}
