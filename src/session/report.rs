//! End-of-session summary.

use super::SessionState;
use crate::store::SessionLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Running counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Candidates handed to the dedup gate.
    pub seen: usize,
    pub duplicates: usize,
    pub inserted: usize,
    /// Failed lookups, inserts, scroll attempts and scopes.
    pub errors: usize,
    pub scroll_attempts: u32,
    /// Scopes (pages) extracted.
    pub scopes: usize,
}

/// Time spent reaching one state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub state: SessionState,
    pub seconds: f64,
}

/// What every session prints when it ends, successfully or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub target: String,
    pub city: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub seen: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub errors: usize,
    pub scroll_attempts: u32,
    pub elapsed_seconds: f64,
    pub throughput_per_second: f64,
    pub stages: Vec<StageTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl SessionReport {
    pub fn new(
        target: String,
        city: String,
        state: SessionState,
        started_at: DateTime<Utc>,
        stats: SessionStats,
        elapsed: Duration,
    ) -> Self {
        let elapsed_seconds = elapsed.as_secs_f64();
        Self {
            target,
            city,
            state,
            started_at,
            seen: stats.seen,
            duplicates: stats.duplicates,
            inserted: stats.inserted,
            errors: stats.errors,
            scroll_attempts: stats.scroll_attempts,
            elapsed_seconds,
            throughput_per_second: throughput(stats.seen, elapsed_seconds),
            stages: Vec::new(),
            failure: None,
        }
    }

    pub fn with_stages(mut self, stages: Vec<StageTiming>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_failure(mut self, failure: Option<String>) -> Self {
        self.failure = failure;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Row for the session log table.
    pub fn to_log(&self) -> SessionLog {
        SessionLog {
            timestamp: self.started_at,
            city: self.city.clone(),
            target: self.target.clone(),
            status: self.state.to_string(),
            seen: self.seen,
            duplicates: self.duplicates,
            inserted: self.inserted,
            errors: self.errors,
            duration_seconds: self.elapsed_seconds,
        }
    }
}

/// Candidates per second; zero for an instant session.
pub fn throughput(seen: usize, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds > 0.0 {
        seen as f64 / elapsed_seconds
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(10, 2.0), 5.0);
        assert_eq!(throughput(10, 0.0), 0.0);
    }

    #[test]
    fn test_report_and_log_row() {
        let stats = SessionStats { seen: 3, duplicates: 1, inserted: 2, ..Default::default() };
        let report = SessionReport::new(
            "categories".into(),
            "X".into(),
            SessionState::Reported,
            Utc::now(),
            stats,
            Duration::from_secs(3),
        );
        assert_eq!(report.throughput_per_second, 1.0);
        assert!(report.succeeded());

        let log = report.to_log();
        assert_eq!(log.status, "reported");
        assert_eq!((log.seen, log.duplicates, log.inserted), (3, 1, 2));

        let failed = report.with_failure(Some("boom".into()));
        assert!(!failed.succeeded());
    }
}
