//! The embedded SQLite ledger backend.
//!
//! A single-file store with a bounded connection pool. Schema evolution
//! is append-only: every migration runs once and is recorded in
//! `schema_migrations`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::clock::SharedClock;
use crate::config::StorageConfig;
use crate::repourl::ProviderKind;

use super::{BranchState, Event, EventStatus, EventType, Ledger, LedgerError, LedgerStats};

const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_initial",
    r#"
    CREATE TABLE branch_state (
        repository     TEXT NOT NULL,
        branch         TEXT NOT NULL,
        commit_sha     TEXT NOT NULL,
        last_checked   INTEGER NOT NULL,
        missing_cycles INTEGER NOT NULL DEFAULT 0,
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL,
        PRIMARY KEY (repository, branch)
    );

    CREATE TABLE events (
        id               TEXT PRIMARY KEY,
        type             TEXT NOT NULL,
        repository       TEXT NOT NULL,
        branch           TEXT NOT NULL,
        commit_sha       TEXT NOT NULL,
        provider         TEXT NOT NULL,
        timestamp        INTEGER NOT NULL,
        status           TEXT NOT NULL,
        metadata_json    TEXT NOT NULL DEFAULT '{}',
        redrive_attempts INTEGER NOT NULL DEFAULT 0,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL
    );

    CREATE INDEX idx_events_status_created ON events (status, created_at);
    CREATE INDEX idx_events_repo_created ON events (repository, created_at DESC);
    "#,
)];

pub struct SqliteLedger {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqliteLedger {
    /// Opens (creating if necessary) the ledger at the configured path and
    /// applies any outstanding migrations.
    pub async fn open(config: &StorageConfig, clock: SharedClock) -> Result<Self, LedgerError> {
        if let Some(parent) = config.path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(config.path.as_std_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.connection_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout)
            .connect_with(options)
            .await?;

        let ledger = Self { pool, clock };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for (version, sql) in MIGRATIONS.iter().copied() {
            let applied: Option<SqliteRow> =
                sqlx::query("SELECT version FROM schema_migrations WHERE version = ?1")
                    .bind(version)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
                .bind(version)
                .bind(self.clock.now().timestamp_millis())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::info!(version, "applied ledger migration");
        }

        Ok(())
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| LedgerError::Corrupt {
        context: format!("timestamp {millis} out of range"),
    })
}

fn branch_state_from_row(row: &SqliteRow) -> Result<BranchState, LedgerError> {
    Ok(BranchState {
        repository: row.get("repository"),
        branch: row.get("branch"),
        last_commit_sha: row.get("commit_sha"),
        last_checked_at: from_millis(row.get("last_checked"))?,
        missing_cycles: row.get::<i64, _>("missing_cycles") as u32,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, LedgerError> {
    let type_raw: String = row.get("type");
    let status_raw: String = row.get("status");
    let provider_raw: String = row.get("provider");
    let metadata_raw: String = row.get("metadata_json");

    let event_type = EventType::parse(&type_raw).ok_or_else(|| LedgerError::Corrupt {
        context: format!("unknown event type `{type_raw}`"),
    })?;
    let status = EventStatus::parse(&status_raw).ok_or_else(|| LedgerError::Corrupt {
        context: format!("unknown event status `{status_raw}`"),
    })?;
    let provider = match provider_raw.as_str() {
        "github" => ProviderKind::Github,
        "gitlab" => ProviderKind::Gitlab,
        other => {
            return Err(LedgerError::Corrupt {
                context: format!("unknown provider `{other}`"),
            });
        }
    };
    let metadata: IndexMap<String, String> = serde_json::from_str(&metadata_raw)?;

    Ok(Event {
        id: row.get("id"),
        event_type,
        repository: row.get("repository"),
        branch: row.get("branch"),
        commit_sha: row.get("commit_sha"),
        provider,
        timestamp: from_millis(row.get("timestamp"))?,
        status,
        metadata,
        redrive_attempts: row.get::<i64, _>("redrive_attempts") as u32,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

fn events_from_rows(rows: Vec<SqliteRow>) -> Result<Vec<Event>, LedgerError> {
    rows.iter().map(event_from_row).collect()
}

const SELECT_EVENT: &str = "SELECT id, type, repository, branch, commit_sha, provider, timestamp, \
     status, metadata_json, redrive_attempts, created_at, updated_at FROM events";

async fn upsert_branch_row(
    conn: &mut sqlx::SqliteConnection,
    repository: &str,
    branch: &str,
    commit_sha: &str,
    checked_at_millis: i64,
    now_millis: i64,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO branch_state
             (repository, branch, commit_sha, last_checked, missing_cycles, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
         ON CONFLICT (repository, branch) DO UPDATE SET
             commit_sha = excluded.commit_sha,
             last_checked = excluded.last_checked,
             missing_cycles = 0,
             updated_at = excluded.updated_at",
    )
    .bind(repository)
    .bind(branch)
    .bind(commit_sha)
    .bind(checked_at_millis)
    .bind(now_millis)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn upsert_branch_state(
        &self,
        repository: &str,
        branch: &str,
        commit_sha: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut conn = self.pool.acquire().await?;
        upsert_branch_row(
            &mut conn,
            repository,
            branch,
            commit_sha,
            checked_at.timestamp_millis(),
            self.now_millis(),
        )
        .await
    }

    async fn get_branch_state(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<Option<BranchState>, LedgerError> {
        let row = sqlx::query(
            "SELECT repository, branch, commit_sha, last_checked, missing_cycles, created_at, updated_at
             FROM branch_state WHERE repository = ?1 AND branch = ?2",
        )
        .bind(repository)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(branch_state_from_row).transpose()
    }

    async fn list_branch_states(&self, repository: &str) -> Result<Vec<BranchState>, LedgerError> {
        let rows = sqlx::query(
            "SELECT repository, branch, commit_sha, last_checked, missing_cycles, created_at, updated_at
             FROM branch_state WHERE repository = ?1 ORDER BY branch",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(branch_state_from_row).collect()
    }

    async fn delete_branch_state(&self, repository: &str, branch: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM branch_state WHERE repository = ?1 AND branch = ?2")
            .bind(repository)
            .bind(branch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_branch_missing(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<u32, LedgerError> {
        let row = sqlx::query(
            "UPDATE branch_state
             SET missing_cycles = missing_cycles + 1, updated_at = ?3
             WHERE repository = ?1 AND branch = ?2
             RETURNING missing_cycles",
        )
        .bind(repository)
        .bind(branch)
        .bind(self.now_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("missing_cycles") as u32).unwrap_or(0))
    }

    async fn create_event(&self, event: &Event) -> Result<(), LedgerError> {
        let metadata_json = serde_json::to_string(&event.metadata)?;

        let result = sqlx::query(
            "INSERT INTO events
                 (id, type, repository, branch, commit_sha, provider, timestamp, status,
                  metadata_json, redrive_attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&event.id)
        .bind(event.event_type.as_str())
        .bind(&event.repository)
        .bind(&event.branch)
        .bind(&event.commit_sha)
        .bind(event.provider.as_str())
        .bind(event.timestamp.timestamp_millis())
        .bind(event.status.as_str())
        .bind(metadata_json)
        .bind(i64::from(event.redrive_attempts))
        .bind(event.created_at.timestamp_millis())
        .bind(event.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation()) =>
            {
                Err(LedgerError::DuplicateEvent {
                    id: event.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_event_status(&self, id: &str, status: EventStatus) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::NoSuchEvent { id: id.into() })?;

        let current_raw: String = row.get("status");
        let current = EventStatus::parse(&current_raw).ok_or_else(|| LedgerError::Corrupt {
            context: format!("unknown event status `{current_raw}`"),
        })?;

        if !current.can_transition_to(status) {
            return Err(LedgerError::IllegalTransition {
                id: id.into(),
                from: current,
                to: status,
            });
        }

        sqlx::query("UPDATE events SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .bind(self.now_millis())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn begin_redrive(&self, id: &str) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::NoSuchEvent { id: id.into() })?;

        let current_raw: String = row.get("status");
        let current = EventStatus::parse(&current_raw).ok_or_else(|| LedgerError::Corrupt {
            context: format!("unknown event status `{current_raw}`"),
        })?;

        if current != EventStatus::Failed {
            return Err(LedgerError::IllegalTransition {
                id: id.into(),
                from: current,
                to: EventStatus::InFlight,
            });
        }

        sqlx::query(
            "UPDATE events
             SET status = 'in_flight', redrive_attempts = redrive_attempts + 1, updated_at = ?2
             WHERE id = ?1",
        )
        .bind(id)
        .bind(self.now_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_delivery(&self, id: &str) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT repository, branch, commit_sha, status FROM events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::NoSuchEvent { id: id.into() })?;

        let current_raw: String = row.get("status");
        let current = EventStatus::parse(&current_raw).ok_or_else(|| LedgerError::Corrupt {
            context: format!("unknown event status `{current_raw}`"),
        })?;
        if !current.can_transition_to(EventStatus::Delivered) {
            return Err(LedgerError::IllegalTransition {
                id: id.into(),
                from: current,
                to: EventStatus::Delivered,
            });
        }

        let repository: String = row.get("repository");
        let branch: String = row.get("branch");
        let commit_sha: String = row.get("commit_sha");
        let now = self.now_millis();

        sqlx::query("UPDATE events SET status = 'delivered', updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        upsert_branch_row(&mut tx, &repository, &branch, &commit_sha, now, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>, LedgerError> {
        let row = sqlx::query(&format!("{SELECT_EVENT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn get_pending_events(&self, limit: u32) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn get_failed_events(
        &self,
        limit: u32,
        max_redrives: u32,
    ) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE status = 'failed' AND redrive_attempts < ?1
             ORDER BY created_at ASC LIMIT ?2"
        ))
        .bind(i64::from(max_redrives))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn get_events_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE created_at >= ?1 ORDER BY created_at ASC"
        ))
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn get_events(&self, limit: u32, offset: u32) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn get_events_by_repository(
        &self,
        repository: &str,
        limit: u32,
    ) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE repository = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(repository)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        events_from_rows(rows)
    }

    async fn has_active_event(&self, repository: &str, branch: &str) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM events
                 WHERE repository = ?1 AND branch = ?2 AND status IN ('pending', 'in_flight')
             ) AS active",
        )
        .bind(repository)
        .bind(branch)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("active") != 0)
    }

    async fn reset_in_flight(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE events SET status = 'pending', updated_at = ?1 WHERE status = 'in_flight'",
        )
        .bind(self.now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM events WHERE created_at < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let row = sqlx::query(
            "SELECT
                 (SELECT COUNT(DISTINCT repository) FROM branch_state) AS repositories,
                 (SELECT COUNT(*) FROM branch_state) AS branches,
                 (SELECT COUNT(*) FROM events) AS events_total,
                 (SELECT COUNT(*) FROM events WHERE status = 'pending') AS events_pending,
                 (SELECT COUNT(*) FROM events WHERE status = 'failed') AS events_failed,
                 (SELECT MAX(created_at) FROM events) AS last_event_at,
                 (SELECT MIN(created_at) FROM events WHERE status = 'pending') AS oldest_pending_at",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerStats {
            repositories: row.get::<i64, _>("repositories") as u64,
            branches: row.get::<i64, _>("branches") as u64,
            events_total: row.get::<i64, _>("events_total") as u64,
            events_pending: row.get::<i64, _>("events_pending") as u64,
            events_failed: row.get::<i64, _>("events_failed") as u64,
            last_event_at: row
                .get::<Option<i64>, _>("last_event_at")
                .map(from_millis)
                .transpose()?,
            oldest_pending_at: row
                .get::<Option<i64>, _>("oldest_pending_at")
                .map(from_millis)
                .transpose()?,
        })
    }

    async fn health(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
