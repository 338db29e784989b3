//! SQLite persistence: events with change-detecting upserts and per-field
//! history, fetch-run bookkeeping, and circuit-breaker source health.

use chrono::{DateTime, Duration, Utc};
use kultur_core::{Category, Event, EventDraft};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kultur-db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    source_id       TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL,
    kind            TEXT NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    priority        INTEGER NOT NULL DEFAULT 100
);

CREATE TABLE IF NOT EXISTS events (
    id              TEXT PRIMARY KEY,
    source_id       TEXT NOT NULL,
    source_event_id TEXT,
    signature       TEXT NOT NULL,
    title           TEXT NOT NULL,
    description     TEXT,
    starts_at       TEXT NOT NULL,
    ends_at         TEXT,
    venue           TEXT,
    address         TEXT,
    category        TEXT,
    url             TEXT,
    ticket_url      TEXT,
    image_url       TEXT,
    organizer       TEXT,
    price_text      TEXT,
    price_min_nok   REAL,
    content_hash    TEXT NOT NULL,
    canonical_id    TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    last_seen_at    TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_source_native
    ON events (source_id, source_event_id)
    WHERE source_event_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_source_signature
    ON events (source_id, signature)
    WHERE source_event_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_events_starts_at ON events (starts_at);

CREATE TABLE IF NOT EXISTS event_history (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id        TEXT NOT NULL,
    changed_at      TEXT NOT NULL,
    changed_fields  TEXT NOT NULL,
    previous_json   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_event ON event_history (event_id);

CREATE TABLE IF NOT EXISTS fetch_runs (
    run_id            TEXT PRIMARY KEY,
    started_at        TEXT NOT NULL,
    finished_at       TEXT NOT NULL,
    status            TEXT NOT NULL,
    sources_attempted INTEGER NOT NULL,
    sources_failed    INTEGER NOT NULL,
    drafts_parsed     INTEGER NOT NULL,
    events_inserted   INTEGER NOT NULL,
    events_updated    INTEGER NOT NULL,
    events_unchanged  INTEGER NOT NULL,
    events_merged     INTEGER NOT NULL,
    review_queued     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS source_health (
    source_id            TEXT PRIMARY KEY,
    state                TEXT NOT NULL DEFAULT 'closed',
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    open_until           TEXT,
    last_success_at      TEXT,
    last_failure_at      TEXT,
    last_error           TEXT
);

CREATE TABLE IF NOT EXISTS review_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_a     TEXT NOT NULL,
    event_b     TEXT NOT NULL,
    score       REAL NOT NULL,
    strategy    TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'open',
    queued_at   TEXT NOT NULL,
    resolved_at TEXT,
    UNIQUE (event_a, event_b)
);
"#;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: Uuid },
    Updated { id: Uuid, changed_fields: Vec<String> },
    Unchanged { id: Uuid },
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted { id }
            | UpsertOutcome::Updated { id, .. }
            | UpsertOutcome::Unchanged { id } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn parse(input: &str) -> Result<BreakerState, DbError> {
        match input {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            other => Err(DbError::Corrupt(format!("breaker state `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::hours(6),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub source_id: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_until: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SourceHealth {
    pub fn fresh(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_until: None,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
        }
    }

    pub fn note_success(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.last_success_at = Some(now);
        self.last_error = None;
    }

    pub fn note_failure(&mut self, now: DateTime<Utc>, error: &str, policy: &BreakerPolicy) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
        self.last_error = Some(error.to_string());

        // One failed trial while half-open reopens immediately.
        let tripped = self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= policy.failure_threshold;
        if tripped {
            self.state = BreakerState::Open;
            self.open_until = Some(now + policy.cooldown);
        }
    }

    /// Decide whether the source may be fetched now. An elapsed cooldown
    /// moves the breaker to half-open, which admits exactly one trial run.
    pub fn admit(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => match self.open_until {
                Some(until) if now >= until => {
                    self.state = BreakerState::HalfOpen;
                    true
                }
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub sources_attempted: i64,
    pub sources_failed: i64,
    pub drafts_parsed: i64,
    pub events_inserted: i64,
    pub events_updated: i64,
    pub events_unchanged: i64,
    pub events_merged: i64,
    pub review_queued: i64,
}

#[derive(Debug, Clone)]
pub struct ReviewPair {
    pub id: i64,
    pub event_a: Uuid,
    pub event_b: Uuid,
    pub score: f64,
    pub strategy: String,
    pub queued_at: DateTime<Utc>,
}

/// Fields that participate in change detection. Identity and bookkeeping
/// columns stay out so re-seeing an identical posting is a no-op.
#[derive(Serialize)]
struct HashedFields<'a> {
    title: &'a str,
    description: Option<&'a str>,
    starts_at: &'a DateTime<Utc>,
    ends_at: Option<&'a DateTime<Utc>>,
    venue: Option<&'a str>,
    address: Option<&'a str>,
    category: Option<&'a str>,
    url: Option<&'a str>,
    ticket_url: Option<&'a str>,
    image_url: Option<&'a str>,
    organizer: Option<&'a str>,
    price_text: Option<&'a str>,
    price_min_nok: Option<f64>,
}

pub fn content_hash(draft: &EventDraft) -> String {
    let fields = HashedFields {
        title: &draft.title,
        description: draft.description.as_deref(),
        starts_at: &draft.starts_at,
        ends_at: draft.ends_at.as_ref(),
        venue: draft.venue.as_deref(),
        address: draft.address.as_deref(),
        category: draft.category.map(|c| c.as_str()),
        url: draft.url.as_deref(),
        ticket_url: draft.ticket_url.as_deref(),
        image_url: draft.image_url.as_deref(),
        organizer: draft.organizer.as_deref(),
        price_text: draft.price_text.as_deref(),
        price_min_nok: draft.price_min_nok,
    };
    let json = serde_json::to_vec(&fields).expect("hash fields always serialize");
    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

/// Stable row id: v5 over the source plus its most specific key.
fn row_uid(draft: &EventDraft, signature: &str) -> Uuid {
    let key = match &draft.source_event_id {
        Some(native) => format!("{}#{}", draft.source_id, native),
        None => format!("{}|{}", draft.source_id, signature),
    };
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database for tests.
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_source(
        &self,
        source_id: &str,
        display_name: &str,
        kind: &str,
        enabled: bool,
        priority: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, display_name, kind, enabled, priority)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (source_id) DO UPDATE SET
                display_name = excluded.display_name,
                kind = excluded.kind,
                enabled = excluded.enabled,
                priority = excluded.priority
            "#,
        )
        .bind(source_id)
        .bind(display_name)
        .bind(kind)
        .bind(enabled)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or update one draft. Unchanged content only refreshes
    /// `last_seen_at`; changed content updates in place and appends a history
    /// row with the prior state and the list of changed fields.
    pub async fn upsert_event(&self, draft: &EventDraft) -> Result<UpsertOutcome, DbError> {
        let signature = draft.signature();
        let hash = content_hash(draft);
        let now = draft.fetched_at;

        let existing = match &draft.source_event_id {
            Some(native_id) => {
                sqlx::query(
                    "SELECT * FROM events WHERE source_id = ?1 AND source_event_id = ?2",
                )
                .bind(&draft.source_id)
                .bind(native_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM events WHERE source_id = ?1 AND signature = ?2")
                    .bind(&draft.source_id)
                    .bind(&signature)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        let Some(row) = existing else {
            let id = row_uid(draft, &signature);
            sqlx::query(
                r#"
                INSERT INTO events (
                    id, source_id, source_event_id, signature, title, description,
                    starts_at, ends_at, venue, address, category, url, ticket_url,
                    image_url, organizer, price_text, price_min_nok, content_hash,
                    canonical_id, created_at, updated_at, last_seen_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, NULL, ?19, ?19, ?19
                )
                "#,
            )
            .bind(id.to_string())
            .bind(&draft.source_id)
            .bind(&draft.source_event_id)
            .bind(&signature)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(draft.starts_at)
            .bind(draft.ends_at)
            .bind(&draft.venue)
            .bind(&draft.address)
            .bind(draft.category.map(|c| c.as_str()))
            .bind(&draft.url)
            .bind(&draft.ticket_url)
            .bind(&draft.image_url)
            .bind(&draft.organizer)
            .bind(&draft.price_text)
            .bind(draft.price_min_nok)
            .bind(&hash)
            .bind(now)
            .execute(&self.pool)
            .await?;
            return Ok(UpsertOutcome::Inserted { id });
        };

        let stored = event_from_row(&row)?;
        let stored_hash: String = row.try_get("content_hash")?;
        if stored_hash == hash {
            sqlx::query("UPDATE events SET last_seen_at = ?1 WHERE id = ?2")
                .bind(now)
                .bind(stored.id.to_string())
                .execute(&self.pool)
                .await?;
            return Ok(UpsertOutcome::Unchanged { id: stored.id });
        }

        let changed_fields = diff_fields(&stored, draft);
        debug!(event_id = %stored.id, ?changed_fields, "event content changed");

        let previous_json = serde_json::to_string(&stored)
            .map_err(|err| DbError::Corrupt(err.to_string()))?;

        // History row and the row update land together or not at all.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO event_history (event_id, changed_at, changed_fields, previous_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(stored.id.to_string())
        .bind(now)
        .bind(changed_fields.join(","))
        .bind(previous_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE events SET
                signature = ?1, title = ?2, description = ?3, starts_at = ?4,
                ends_at = ?5, venue = ?6, address = ?7, category = ?8, url = ?9,
                ticket_url = ?10, image_url = ?11, organizer = ?12,
                price_text = ?13, price_min_nok = ?14, content_hash = ?15,
                updated_at = ?16, last_seen_at = ?16
            WHERE id = ?17
            "#,
        )
        .bind(&signature)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(draft.starts_at)
        .bind(draft.ends_at)
        .bind(&draft.venue)
        .bind(&draft.address)
        .bind(draft.category.map(|c| c.as_str()))
        .bind(&draft.url)
        .bind(&draft.ticket_url)
        .bind(&draft.image_url)
        .bind(&draft.organizer)
        .bind(&draft.price_text)
        .bind(draft.price_min_nok)
        .bind(&hash)
        .bind(now)
        .bind(stored.id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(UpsertOutcome::Updated {
            id: stored.id,
            changed_fields,
        })
    }

    /// Canonical (unmerged) events starting at or after `from`.
    pub async fn upcoming_events(&self, from: DateTime<Utc>) -> Result<Vec<Event>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE canonical_id IS NULL AND starts_at >= ?1
            ORDER BY starts_at ASC, title ASC
            "#,
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Canonical events in a window, used as dedupe context for a new run.
    pub async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE canonical_id IS NULL AND starts_at >= ?1 AND starts_at <= ?2
            ORDER BY starts_at ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn event_by_id(&self, id: Uuid) -> Result<Option<Event>, DbError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    /// Point duplicate rows at their canonical event.
    pub async fn mark_duplicates(
        &self,
        canonical_id: Uuid,
        duplicate_ids: &[Uuid],
    ) -> Result<u64, DbError> {
        let mut marked = 0;
        for duplicate in duplicate_ids {
            if *duplicate == canonical_id {
                continue;
            }
            let result = sqlx::query("UPDATE events SET canonical_id = ?1 WHERE id = ?2")
                .bind(canonical_id.to_string())
                .bind(duplicate.to_string())
                .execute(&self.pool)
                .await?;
            marked += result.rows_affected();
        }
        Ok(marked)
    }

    pub async fn queue_review(
        &self,
        event_a: Uuid,
        event_b: Uuid,
        score: f64,
        strategy: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        // Order the pair so (a, b) and (b, a) hit the same unique slot.
        let (first, second) = if event_a.to_string() <= event_b.to_string() {
            (event_a, event_b)
        } else {
            (event_b, event_a)
        };
        sqlx::query(
            r#"
            INSERT INTO review_queue (event_a, event_b, score, strategy, status, queued_at)
            VALUES (?1, ?2, ?3, ?4, 'open', ?5)
            ON CONFLICT (event_a, event_b) DO NOTHING
            "#,
        )
        .bind(first.to_string())
        .bind(second.to_string())
        .bind(score)
        .bind(strategy)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn open_review_pairs(&self) -> Result<Vec<ReviewPair>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_a, event_b, score, strategy, queued_at
            FROM review_queue WHERE status = 'open' ORDER BY score DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ReviewPair {
                    id: row.try_get("id")?,
                    event_a: parse_uuid(row.try_get::<String, _>("event_a")?)?,
                    event_b: parse_uuid(row.try_get::<String, _>("event_b")?)?,
                    score: row.try_get("score")?,
                    strategy: row.try_get("strategy")?,
                    queued_at: row.try_get("queued_at")?,
                })
            })
            .collect()
    }

    pub async fn resolve_review(&self, review_id: i64, now: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE review_queue SET status = 'resolved', resolved_at = ?1
            WHERE id = ?2 AND status = 'open'
            "#,
        )
        .bind(now)
        .bind(review_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_run(&self, run: &RunRecord) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO fetch_runs (
                run_id, started_at, finished_at, status, sources_attempted,
                sources_failed, drafts_parsed, events_inserted, events_updated,
                events_unchanged, events_merged, review_queued
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.status)
        .bind(run.sources_attempted)
        .bind(run.sources_failed)
        .bind(run.drafts_parsed)
        .bind(run.events_inserted)
        .bind(run.events_updated)
        .bind(run.events_unchanged)
        .bind(run.events_merged)
        .bind(run.review_queued)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_run(&self) -> Result<Option<RunRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM fetch_runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(RunRecord {
                run_id: parse_uuid(row.try_get::<String, _>("run_id")?)?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                status: row.try_get("status")?,
                sources_attempted: row.try_get("sources_attempted")?,
                sources_failed: row.try_get("sources_failed")?,
                drafts_parsed: row.try_get("drafts_parsed")?,
                events_inserted: row.try_get("events_inserted")?,
                events_updated: row.try_get("events_updated")?,
                events_unchanged: row.try_get("events_unchanged")?,
                events_merged: row.try_get("events_merged")?,
                review_queued: row.try_get("review_queued")?,
            })
        })
        .transpose()
    }

    pub async fn event_history(&self, event_id: Uuid) -> Result<Vec<(DateTime<Utc>, Vec<String>)>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT changed_at, changed_fields FROM event_history
            WHERE event_id = ?1 ORDER BY changed_at DESC
            "#,
        )
        .bind(event_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let changed_at: DateTime<Utc> = row.try_get("changed_at")?;
                let fields: String = row.try_get("changed_fields")?;
                Ok((
                    changed_at,
                    fields.split(',').map(ToString::to_string).collect(),
                ))
            })
            .collect()
    }

    pub async fn source_health(&self, source_id: &str) -> Result<SourceHealth, DbError> {
        let row = sqlx::query("SELECT * FROM source_health WHERE source_id = ?1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(SourceHealth {
                source_id: row.try_get("source_id")?,
                state: BreakerState::parse(&row.try_get::<String, _>("state")?)?,
                consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
                open_until: row.try_get("open_until")?,
                last_success_at: row.try_get("last_success_at")?,
                last_failure_at: row.try_get("last_failure_at")?,
                last_error: row.try_get("last_error")?,
            }),
            None => Ok(SourceHealth::fresh(source_id)),
        }
    }

    pub async fn all_source_health(&self) -> Result<Vec<SourceHealth>, DbError> {
        let rows = sqlx::query("SELECT * FROM source_health ORDER BY source_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SourceHealth {
                    source_id: row.try_get("source_id")?,
                    state: BreakerState::parse(&row.try_get::<String, _>("state")?)?,
                    consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
                    open_until: row.try_get("open_until")?,
                    last_success_at: row.try_get("last_success_at")?,
                    last_failure_at: row.try_get("last_failure_at")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }

    pub async fn save_source_health(&self, health: &SourceHealth) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO source_health (
                source_id, state, consecutive_failures, open_until,
                last_success_at, last_failure_at, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (source_id) DO UPDATE SET
                state = excluded.state,
                consecutive_failures = excluded.consecutive_failures,
                open_until = excluded.open_until,
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&health.source_id)
        .bind(health.state.as_str())
        .bind(health.consecutive_failures as i64)
        .bind(health.open_until)
        .bind(health.last_success_at)
        .bind(health.last_failure_at)
        .bind(&health.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Breaker check plus persistence of the open -> half-open transition.
    pub async fn admit_source(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut health = self.source_health(source_id).await?;
        let before = health.state;
        let admitted = health.admit(now);
        if health.state != before {
            self.save_source_health(&health).await?;
        }
        Ok(admitted)
    }

    pub async fn record_source_success(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut health = self.source_health(source_id).await?;
        health.note_success(now);
        self.save_source_health(&health).await
    }

    pub async fn record_source_failure(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
        error: &str,
        policy: &BreakerPolicy,
    ) -> Result<SourceHealth, DbError> {
        let mut health = self.source_health(source_id).await?;
        health.note_failure(now, error, policy);
        self.save_source_health(&health).await?;
        Ok(health)
    }
}

fn parse_uuid(value: String) -> Result<Uuid, DbError> {
    Uuid::parse_str(&value).map_err(|err| DbError::Corrupt(format!("uuid `{value}`: {err}")))
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Event, DbError> {
    let category: Option<String> = row.try_get("category")?;
    let canonical_id: Option<String> = row.try_get("canonical_id")?;
    Ok(Event {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        source_id: row.try_get("source_id")?,
        source_event_id: row.try_get("source_event_id")?,
        signature: row.try_get("signature")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        venue: row.try_get("venue")?,
        address: row.try_get("address")?,
        category: category.as_deref().and_then(Category::parse),
        url: row.try_get("url")?,
        ticket_url: row.try_get("ticket_url")?,
        image_url: row.try_get("image_url")?,
        organizer: row.try_get("organizer")?,
        price_text: row.try_get("price_text")?,
        price_min_nok: row.try_get("price_min_nok")?,
        canonical_id: canonical_id.map(parse_uuid).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn diff_fields(stored: &Event, draft: &EventDraft) -> Vec<String> {
    let mut changed = Vec::new();
    if stored.title != draft.title {
        changed.push("title".to_string());
    }
    if stored.description != draft.description {
        changed.push("description".to_string());
    }
    if stored.starts_at != draft.starts_at {
        changed.push("starts_at".to_string());
    }
    if stored.ends_at != draft.ends_at {
        changed.push("ends_at".to_string());
    }
    if stored.venue != draft.venue {
        changed.push("venue".to_string());
    }
    if stored.address != draft.address {
        changed.push("address".to_string());
    }
    if stored.category != draft.category {
        changed.push("category".to_string());
    }
    if stored.url != draft.url {
        changed.push("url".to_string());
    }
    if stored.ticket_url != draft.ticket_url {
        changed.push("ticket_url".to_string());
    }
    if stored.image_url != draft.image_url {
        changed.push("image_url".to_string());
    }
    if stored.organizer != draft.organizer {
        changed.push("organizer".to_string());
    }
    if stored.price_text != draft.price_text {
        changed.push("price_text".to_string());
    }
    if stored.price_min_nok != draft.price_min_nok {
        changed.push("price_min_nok".to_string());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 5, h, 0, 0).single().unwrap()
    }

    fn draft(title: &str) -> EventDraft {
        EventDraft {
            source_id: "kulturhuset".into(),
            source_event_id: None,
            title: title.into(),
            description: Some("Konsert".into()),
            starts_at: ts(17),
            ends_at: None,
            venue: Some("Storsalen".into()),
            address: None,
            category: Some(Category::Konsert),
            url: Some("https://kulturhuset.no/jazz".into()),
            ticket_url: None,
            image_url: None,
            organizer: None,
            price_text: Some("Kr 250".into()),
            price_min_nok: Some(250.0),
            fetched_at: ts(6),
        }
    }

    #[tokio::test]
    async fn insert_then_unchanged_then_updated() {
        let db = Db::in_memory().await.unwrap();

        let first = db.upsert_event(&draft("Jazzkveld")).await.unwrap();
        let id = match first {
            UpsertOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {other:?}"),
        };

        let second = db.upsert_event(&draft("Jazzkveld")).await.unwrap();
        assert_eq!(second, UpsertOutcome::Unchanged { id });

        let mut changed = draft("Jazzkveld");
        changed.description = Some("Konsert med utvidet program".into());
        changed.price_min_nok = Some(300.0);
        changed.price_text = Some("Kr 300".into());
        let third = db.upsert_event(&changed).await.unwrap();
        match third {
            UpsertOutcome::Updated { id: updated_id, changed_fields } => {
                assert_eq!(updated_id, id);
                assert!(changed_fields.contains(&"description".to_string()));
                assert!(changed_fields.contains(&"price_min_nok".to_string()));
                assert!(!changed_fields.contains(&"title".to_string()));
            }
            other => panic!("expected update, got {other:?}"),
        }

        let history = db.event_history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].1.contains(&"description".to_string()));
    }

    #[tokio::test]
    async fn native_id_wins_over_signature_for_identity() {
        let db = Db::in_memory().await.unwrap();

        let mut original = draft("Høstkonsert");
        original.source_event_id = Some("evt-1".into());
        let first = db.upsert_event(&original).await.unwrap();

        // Title change moves the signature but the native id pins identity.
        let mut renamed = original.clone();
        renamed.title = "Høstkonsert (utsolgt)".into();
        let second = db.upsert_event(&renamed).await.unwrap();
        match second {
            UpsertOutcome::Updated { id, changed_fields } => {
                assert_eq!(id, first.id());
                assert!(changed_fields.contains(&"title".to_string()));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn native_id_events_may_share_a_signature() {
        let db = Db::in_memory().await.unwrap();

        // Two same-named performances on the same evening, venue omitted by
        // the source. Their native ids keep them distinct rows.
        let mut early = draft("Sommerrevy");
        early.source_event_id = Some("evt-1".into());
        early.venue = None;
        let mut late = draft("Sommerrevy");
        late.source_event_id = Some("evt-2".into());
        late.venue = None;

        let first = db.upsert_event(&early).await.unwrap();
        let second = db.upsert_event(&late).await.unwrap();
        assert!(matches!(first, UpsertOutcome::Inserted { .. }));
        assert!(matches!(second, UpsertOutcome::Inserted { .. }));
        assert_ne!(first.id(), second.id());

        // A retitle that lands on an already-taken signature still updates.
        let mut other = draft("Revypremiere");
        other.source_event_id = Some("evt-3".into());
        other.venue = None;
        let third = db.upsert_event(&other).await.unwrap();

        other.title = "Sommerrevy".into();
        let renamed = db.upsert_event(&other).await.unwrap();
        match renamed {
            UpsertOutcome::Updated { id, changed_fields } => {
                assert_eq!(id, third.id());
                assert!(changed_fields.contains(&"title".to_string()));
            }
            outcome => panic!("expected update, got {outcome:?}"),
        }
    }

    #[tokio::test]
    async fn upcoming_excludes_past_and_merged() {
        let db = Db::in_memory().await.unwrap();

        let mut past = draft("Gammel konsert");
        past.starts_at = Utc.with_ymd_and_hms(2026, 1, 1, 19, 0, 0).single().unwrap();
        db.upsert_event(&past).await.unwrap();

        let a = db.upsert_event(&draft("Jazzkveld")).await.unwrap().id();
        let mut other = draft("Jazzkveld i parken");
        other.source_id = "avisa-kultur".into();
        let b = db.upsert_event(&other).await.unwrap().id();

        db.mark_duplicates(a, &[b]).await.unwrap();

        let upcoming = db.upcoming_events(ts(0)).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, a);
    }

    #[tokio::test]
    async fn review_queue_ignores_duplicate_pairs() {
        let db = Db::in_memory().await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        db.queue_review(a, b, 0.87, "fuzzy", ts(6)).await.unwrap();
        db.queue_review(b, a, 0.91, "fuzzy", ts(7)).await.unwrap();

        let open = db.open_review_pairs().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!((open[0].score - 0.87).abs() < 1e-9);

        assert!(db.resolve_review(open[0].id, ts(8)).await.unwrap());
        assert!(db.open_review_pairs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_recovers() {
        let db = Db::in_memory().await.unwrap();
        let policy = BreakerPolicy {
            failure_threshold: 3,
            cooldown: Duration::hours(6),
        };

        for _ in 0..2 {
            db.record_source_failure("kulturhuset", ts(6), "timeout", &policy)
                .await
                .unwrap();
        }
        assert!(db.admit_source("kulturhuset", ts(7)).await.unwrap());

        let health = db
            .record_source_failure("kulturhuset", ts(7), "timeout", &policy)
            .await
            .unwrap();
        assert_eq!(health.state, BreakerState::Open);

        // Cooldown not elapsed: skip.
        assert!(!db.admit_source("kulturhuset", ts(8)).await.unwrap());

        // Cooldown elapsed: half-open trial is admitted.
        assert!(db.admit_source("kulturhuset", ts(13)).await.unwrap());
        let health = db.source_health("kulturhuset").await.unwrap();
        assert_eq!(health.state, BreakerState::HalfOpen);

        db.record_source_success("kulturhuset", ts(14)).await.unwrap();
        let health = db.source_health("kulturhuset").await.unwrap();
        assert_eq!(health.state, BreakerState::Closed);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let db = Db::in_memory().await.unwrap();
        let policy = BreakerPolicy {
            failure_threshold: 2,
            cooldown: Duration::hours(1),
        };

        for _ in 0..2 {
            db.record_source_failure("avisa-kultur", ts(6), "http 500", &policy)
                .await
                .unwrap();
        }
        assert!(db.admit_source("avisa-kultur", ts(8)).await.unwrap());

        let health = db
            .record_source_failure("avisa-kultur", ts(8), "http 500", &policy)
            .await
            .unwrap();
        assert_eq!(health.state, BreakerState::Open);
        assert_eq!(health.open_until, Some(ts(9)));
    }

    #[tokio::test]
    async fn run_records_round_trip() {
        let db = Db::in_memory().await.unwrap();
        let run = RunRecord {
            run_id: Uuid::new_v4(),
            started_at: ts(6),
            finished_at: ts(7),
            status: "completed".into(),
            sources_attempted: 4,
            sources_failed: 1,
            drafts_parsed: 37,
            events_inserted: 20,
            events_updated: 3,
            events_unchanged: 14,
            events_merged: 2,
            review_queued: 1,
        };
        db.record_run(&run).await.unwrap();

        let latest = db.latest_run().await.unwrap().unwrap();
        assert_eq!(latest.run_id, run.run_id);
        assert_eq!(latest.drafts_parsed, 37);
        assert_eq!(latest.events_merged, 2);
    }

    #[test]
    fn content_hash_ignores_bookkeeping_fields() {
        let a = draft("Jazzkveld");
        let mut b = draft("Jazzkveld");
        b.fetched_at = ts(9);
        assert_eq!(content_hash(&a), content_hash(&b));

        b.venue = Some("Lillesalen".into());
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
