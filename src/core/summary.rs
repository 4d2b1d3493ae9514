//! Aggregated outcome of a batch operation.
//!
//! Item-level failures inside a bulk task are collected here instead of
//! aborting the batch. Counts are always exact; the detail list is capped so a
//! run over thousands of files never produces an unbounded report.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default number of detail entries kept per summary.
pub const DEFAULT_DETAIL_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Failed,
    Skipped,
}

/// One recorded failure or skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub path: PathBuf,
    pub status: ItemStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub details: Vec<ItemDetail>,
    #[serde(skip, default = "default_detail_limit")]
    detail_limit: usize,
}

fn default_detail_limit() -> usize {
    DEFAULT_DETAIL_LIMIT
}

impl Default for OperationSummary {
    fn default() -> Self {
        Self::with_detail_limit(DEFAULT_DETAIL_LIMIT)
    }
}

impl OperationSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detail_limit(detail_limit: usize) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            skipped: 0,
            details: Vec::new(),
            detail_limit,
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, path: impl Into<PathBuf>, reason: impl fmt::Display) {
        self.failed += 1;
        self.push_detail(path.into(), ItemStatus::Failed, reason.to_string());
    }

    pub fn record_skip(&mut self, path: impl Into<PathBuf>, reason: impl fmt::Display) {
        self.skipped += 1;
        self.push_detail(path.into(), ItemStatus::Skipped, reason.to_string());
    }

    fn push_detail(&mut self, path: PathBuf, status: ItemStatus, reason: String) {
        if self.details.len() < self.detail_limit {
            self.details.push(ItemDetail {
                path,
                status,
                reason,
            });
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    /// Number of recorded failures/skips that did not fit in `details`.
    pub fn omitted_details(&self) -> usize {
        (self.failed + self.skipped).saturating_sub(self.details.len())
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for OperationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )?;
        if self.omitted_details() > 0 {
            write!(f, " ({} more not listed)", self.omitted_details())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_stay_exact_while_details_are_capped() {
        let mut summary = OperationSummary::with_detail_limit(3);
        for i in 0..10 {
            summary.record_failure(format!("/tmp/{}.zip", i), "permission denied");
        }
        summary.record_skip("/tmp/x.zip", "already gone");
        summary.record_success();

        assert_eq!(summary.failed, 10);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.details.len(), 3);
        assert_eq!(summary.omitted_details(), 8);
        assert_eq!(summary.total(), 12);
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_display_summary() {
        let mut summary = OperationSummary::new();
        summary.record_success();
        summary.record_success();
        summary.record_skip("/a.rar", "destination exists");
        insta::assert_snapshot!(summary.to_string(), @"2 succeeded, 0 failed, 1 skipped");
    }
}
