//! Append-only collection of migration outcomes

use std::sync::Mutex;

use crate::metrics;
use crate::migrator::{MigrationOutcome, MigrationReport, MigrationStatus};

/// Thread-safe outcome log. Outcomes are never mutated or removed once
/// recorded; a report can be taken at any point, including after
/// cancellation.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    items: Mutex<Vec<MigrationOutcome>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: MigrationOutcome) {
        let resource = outcome.resource_type.to_string();
        match (&outcome.error, &outcome.object) {
            (None, Some(_)) if !outcome.skipped => {
                metrics::OBJECTS_MIGRATED.with_label_values(&[&resource]).inc();
            }
            (Some(_), _) => {
                metrics::OBJECT_FAILURES.with_label_values(&[&resource]).inc();
            }
            _ => {}
        }

        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(outcome);
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot everything recorded so far into a report
    pub fn finalize(&self) -> MigrationReport {
        let items = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let status = if items.iter().any(MigrationOutcome::is_error) {
            MigrationStatus::Failure
        } else {
            MigrationStatus::Success
        };
        MigrationReport { status, items }
    }
}
