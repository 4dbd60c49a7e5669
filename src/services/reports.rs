use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::failure::Failure;
use crate::models::Report;

/// Primary store behind the cached reports route.
///
/// # Counter Memory Ordering
///
/// `fetches` uses `Ordering::Relaxed`: it only feeds `/stats` and tests, and
/// no control flow depends on its exact value.
#[derive(Clone, Default)]
pub struct ReportStore {
    reports: Arc<RwLock<HashMap<u64, Report>>>,
    /// Reads that reached the store (cache misses).
    fetches: Arc<AtomicU64>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a few demo reports.
    pub fn seeded(generated_at: DateTime<Utc>) -> Self {
        let seed = [
            (1, "Daily active users", "growth", vec![("dau", 18_240.0), ("wau", 61_003.0)]),
            (2, "Quarterly revenue", "finance", vec![("revenue", 1_250_000.0), ("margin", 0.31)]),
            (3, "Incident summary", "sre", vec![("incidents", 4.0), ("mttr_minutes", 42.5)]),
        ];

        let reports = seed
            .into_iter()
            .map(|(id, title, owner, figures)| {
                let report = Report {
                    id,
                    title: title.to_string(),
                    owner: owner.to_string(),
                    figures: figures
                        .into_iter()
                        .map(|(name, value)| (name.to_string(), value))
                        .collect(),
                    generated_at,
                };
                (id, report)
            })
            .collect();

        Self {
            reports: Arc::new(RwLock::new(reports)),
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn insert(&self, report: Report) {
        self.reports.write().await.insert(report.id, report);
    }

    /// Read a report from the primary store.
    ///
    /// # Errors
    ///
    /// `NotFound` when no report has this id.
    #[instrument(skip(self))]
    pub async fn fetch(&self, id: u64) -> Result<Report, Failure> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!("Reading report from primary store");

        self.reports
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Failure::not_found(format!("Report {id} not found")))
    }

    /// Reads served by the primary store so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::failure::FailureKind;

    #[tokio::test]
    async fn test_seeded_reports_are_readable() {
        let store = ReportStore::seeded(Utc::now());

        let report = store.fetch(2).await.unwrap();
        assert_eq!(report.owner, "finance");
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_report_is_not_found() {
        let store = ReportStore::new();

        let failure = store.fetch(99).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::NotFound);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = ReportStore::new();
        let clone = store.clone();
        clone
            .insert(Report {
                id: 10,
                title: "t".to_string(),
                owner: "o".to_string(),
                figures: vec![],
                generated_at: Utc::now(),
            })
            .await;

        assert!(store.fetch(10).await.is_ok());
        assert_eq!(clone.fetch_count(), 1);
    }
}
