use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use followsnap::FollowupRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

const PROGRESS_EVERY: usize = 50;
const UNRESOLVED_PREVIEW: usize = 10;

/// What happened to one record write.
#[derive(Debug)]
pub enum WriteOutcome {
    Inserted(i64),
    /// The database has no location code for this location name.
    CodeUnresolved,
    Failed(String),
}

/// The stored-routine calls a snapshot run makes, behind a trait so the
/// run logic is checkable without a live database.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Clear the previous snapshot. Must be committed before any record
    /// write so a later failure cannot resurrect stale rows.
    async fn clear_previous(&self) -> Result<()>;

    /// Write one record in its own transaction; failures stay local to
    /// the record and are reported through the outcome.
    async fn write_record(&self, taken_at: DateTime<Utc>, record: &FollowupRecord)
        -> WriteOutcome;
}

/// Replace the stored snapshot: clear it, then write every record and
/// tally the outcomes. A clear failure aborts; record failures do not.
pub async fn persist_snapshot(
    store: &dyn SnapshotStore,
    taken_at: DateTime<Utc>,
    records: &[FollowupRecord],
) -> Result<RunReport> {
    store.clear_previous().await?;

    let mut report = RunReport::default();
    for (idx, record) in records.iter().enumerate() {
        let outcome = store.write_record(taken_at, record).await;
        report.absorb(record, outcome);
        let done = idx + 1;
        if done % PROGRESS_EVERY == 0 {
            info!(done, total = records.len(), "snapshot write progress");
        }
    }
    Ok(report)
}

/// Tally of a snapshot write. Locations the database could not resolve to a
/// code count as failures and are also listed by name for the summary.
#[derive(Debug, Default)]
pub struct RunReport {
    pub inserted: usize,
    pub failed: usize,
    pub unresolved: Vec<String>,
}

impl RunReport {
    fn absorb(&mut self, record: &FollowupRecord, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted(id) => {
                debug!(id, location = %record.location, "record written");
                self.inserted += 1;
            }
            WriteOutcome::CodeUnresolved => {
                warn!(location = %record.location, "no location code found, skipping record");
                self.failed += 1;
                self.unresolved.push(record.location.clone());
            }
            WriteOutcome::Failed(reason) => {
                error!(location = %record.location, reason = %reason, "failed to write record");
                self.failed += 1;
            }
        }
    }

    pub fn log_summary(&self) {
        info!(
            inserted = self.inserted,
            failed = self.failed,
            "snapshot write complete"
        );
        if self.unresolved.is_empty() {
            return;
        }
        warn!(
            count = self.unresolved.len(),
            "locations without a resolvable code"
        );
        for location in self.unresolved.iter().take(UNRESOLVED_PREVIEW) {
            warn!(location = %location, "unresolved location");
        }
        if self.unresolved.len() > UNRESOLVED_PREVIEW {
            warn!("... and {} more", self.unresolved.len() - UNRESOLVED_PREVIEW);
        }
    }
}

/// Postgres store driving the stored routines over a single connection.
pub struct SnapshotWriter {
    pool: PgPool,
}

impl SnapshotWriter {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .context("connecting to Postgres")?;
        info!("database connection established");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SnapshotStore for SnapshotWriter {
    async fn clear_previous(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("CALL reset_followup_snapshot()")
            .execute(&mut *tx)
            .await
            .context("clearing previous follow-up snapshot")?;
        tx.commit().await?;
        info!("previous snapshot cleared");
        Ok(())
    }

    /// One record through `record_followup_snapshot`. The function resolves
    /// the location name to its code and returns the new row id; a NULL code
    /// means the location is unknown and nothing was inserted.
    async fn write_record(
        &self,
        taken_at: DateTime<Utc>,
        record: &FollowupRecord,
    ) -> WriteOutcome {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => return WriteOutcome::Failed(err.to_string()),
        };

        let row: Result<(Option<i64>, Option<String>), sqlx::Error> = sqlx::query_as(
            "SELECT inserted_id, location_code FROM record_followup_snapshot($1, $2, $3, $4)",
        )
        .bind(taken_at)
        .bind(&record.location)
        .bind(i64::from(record.followups))
        .bind(i64::from(record.unprocessed))
        .fetch_one(&mut *tx)
        .await;

        match row {
            Ok((Some(id), Some(_))) => match tx.commit().await {
                Ok(()) => WriteOutcome::Inserted(id),
                Err(err) => WriteOutcome::Failed(err.to_string()),
            },
            Ok((_, None)) => {
                let _ = tx.rollback().await;
                WriteOutcome::CodeUnresolved
            }
            Ok((None, Some(_))) => {
                let _ = tx.rollback().await;
                WriteOutcome::Failed("no row id returned".to_string())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                WriteOutcome::Failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn record(location: &str) -> FollowupRecord {
        FollowupRecord {
            location: location.to_string(),
            followups: 3,
            unprocessed: 1,
        }
    }

    /// Store fake recording the call order; one location can be scripted
    /// to come back without a code.
    struct ScriptedStore {
        calls: Mutex<Vec<String>>,
        unresolved_location: Option<String>,
    }

    impl ScriptedStore {
        fn new(unresolved_location: Option<&str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                unresolved_location: unresolved_location.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl SnapshotStore for ScriptedStore {
        async fn clear_previous(&self) -> Result<()> {
            self.calls.lock().unwrap().push("clear".to_string());
            Ok(())
        }

        async fn write_record(
            &self,
            _taken_at: DateTime<Utc>,
            record: &FollowupRecord,
        ) -> WriteOutcome {
            let mut calls = self.calls.lock().unwrap();
            calls.push(format!("write {}", record.location));
            let id = calls.len() as i64;
            drop(calls);

            if self.unresolved_location.as_deref() == Some(record.location.as_str()) {
                WriteOutcome::CodeUnresolved
            } else {
                WriteOutcome::Inserted(id)
            }
        }
    }

    #[tokio::test]
    async fn test_persist_clears_before_first_write() {
        let store = ScriptedStore::new(None);
        let records = vec![record("Site A"), record("Site B")];

        let report = persist_snapshot(&store, Utc::now(), &records).await.unwrap();

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["clear", "write Site A", "write Site B"]);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_persist_reports_unresolved_location_once() {
        let store = ScriptedStore::new(Some("Ghost Town"));
        let records = vec![record("Site A"), record("Ghost Town"), record("Site B")];

        let report = persist_snapshot(&store, Utc::now(), &records).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.unresolved, vec!["Ghost Town"]);
    }

    #[test]
    fn test_absorb_tallies_outcomes() {
        let mut report = RunReport::default();
        report.absorb(&record("Site A"), WriteOutcome::Inserted(1));
        report.absorb(&record("Site B"), WriteOutcome::Inserted(2));
        report.absorb(&record("Ghost Town"), WriteOutcome::CodeUnresolved);
        report.absorb(&record("Site C"), WriteOutcome::Failed("boom".to_string()));

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.unresolved, vec!["Ghost Town"]);
    }

    #[test]
    fn test_unresolved_counts_as_failed() {
        let mut report = RunReport::default();
        report.absorb(&record("Nowhere"), WriteOutcome::CodeUnresolved);

        assert_eq!(report.inserted, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.unresolved, vec!["Nowhere"]);
    }
}
