//! Sync pipeline orchestration: fetch every enabled source, archive the raw
//! pages, parse and persist drafts, then run a duplicate pass over the
//! affected window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use kultur_adapters::{adapter_for, AdapterContext, SourceSpec};
use kultur_db::{BreakerPolicy, Db, RunRecord, UpsertOutcome};
use kultur_dedupe::{Candidate, DedupeConfig, DedupeEngine};
use kultur_fetch::{FetchClient, FetchClientConfig, PageArchive};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kultur-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    /// source_id -> priority, used for canonical selection.
    pub fn priorities(&self) -> HashMap<String, i64> {
        self.sources
            .iter()
            .map(|s| (s.source_id.clone(), s.priority))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub archive_dir: PathBuf,
    pub output_dir: PathBuf,
    pub site_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://kultur.db".to_string()),
            archive_dir: std::env::var("ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive")),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./public")),
            site_url: std::env::var("KULTUR_SITE_URL")
                .unwrap_or_else(|_| "http://localhost:8000/".to_string()),
            scheduler_enabled: std::env::var("KULTUR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 5 * * *".to_string()),
            user_agent: std::env::var("KULTUR_USER_AGENT")
                .unwrap_or_else(|_| "kulturkalender-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("KULTUR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: PathBuf::from("."),
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    db: Db,
    archive: PageArchive,
    http: FetchClient,
    dedupe: DedupeEngine,
    breaker: BreakerPolicy,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let db = Db::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let archive = PageArchive::new(config.archive_dir.clone());
        let http = FetchClient::new(FetchClientConfig {
            timeout: StdDuration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            db,
            archive,
            http,
            dedupe: DedupeEngine::new(DedupeConfig::default()),
            breaker: BreakerPolicy::default(),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn run_once(&self) -> Result<RunRecord> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_source_registry().await?;

        let mut run = RunRecord {
            run_id,
            started_at,
            finished_at: started_at,
            status: "running".to_string(),
            sources_attempted: 0,
            sources_failed: 0,
            drafts_parsed: 0,
            events_inserted: 0,
            events_updated: 0,
            events_unchanged: 0,
            events_merged: 0,
            review_queued: 0,
        };

        for spec in &registry.sources {
            self.db
                .upsert_source(
                    &spec.source_id,
                    &spec.display_name,
                    kind_label(spec),
                    spec.enabled,
                    spec.priority,
                )
                .await?;
            if !spec.enabled {
                continue;
            }

            let now = Utc::now();
            if !self.db.admit_source(&spec.source_id, now).await? {
                info!(source_id = %spec.source_id, "breaker open, skipping source");
                continue;
            }

            run.sources_attempted += 1;
            let span = info_span!("source_sync", %run_id, source_id = %spec.source_id);
            match self.sync_source(run_id, spec).instrument(span).await {
                Ok(tally) => {
                    run.drafts_parsed += tally.drafts_parsed;
                    run.events_inserted += tally.inserted;
                    run.events_updated += tally.updated;
                    run.events_unchanged += tally.unchanged;
                    self.db
                        .record_source_success(&spec.source_id, Utc::now())
                        .await?;
                }
                Err(err) => {
                    run.sources_failed += 1;
                    error!(source_id = %spec.source_id, error = %err, "source sync failed");
                    let health = self
                        .db
                        .record_source_failure(
                            &spec.source_id,
                            Utc::now(),
                            &format!("{err:#}"),
                            &self.breaker,
                        )
                        .await?;
                    if health.open_until.is_some() {
                        warn!(
                            source_id = %spec.source_id,
                            failures = health.consecutive_failures,
                            "breaker opened"
                        );
                    }
                }
            }
        }

        let (merged, queued) = dedupe_pass(
            &self.db,
            &self.dedupe,
            &registry.priorities(),
            started_at - Duration::days(1),
            started_at + Duration::days(400),
            Utc::now(),
        )
        .await?;
        run.events_merged = merged;
        run.review_queued = queued;

        run.finished_at = Utc::now();
        run.status = if run.sources_failed == 0 {
            "completed".to_string()
        } else {
            "completed_with_errors".to_string()
        };
        self.db.record_run(&run).await?;

        info!(
            %run_id,
            attempted = run.sources_attempted,
            failed = run.sources_failed,
            parsed = run.drafts_parsed,
            inserted = run.events_inserted,
            updated = run.events_updated,
            merged = run.events_merged,
            "sync run finished"
        );
        Ok(run)
    }

    async fn sync_source(&self, run_id: Uuid, spec: &SourceSpec) -> Result<SourceTally> {
        let adapter = adapter_for(spec.kind);
        let ctx = AdapterContext {
            run_id,
            now: Utc::now(),
        };

        let pages = adapter
            .fetch(&self.http, &ctx, spec)
            .await
            .with_context(|| format!("fetching {}", spec.source_id))?;

        let mut tally = SourceTally::default();
        for page in &pages {
            let stored = self
                .archive
                .archive(page.fetched_at, &spec.source_id, page.extension(), &page.body)
                .await
                .with_context(|| format!("archiving page for {}", spec.source_id))?;
            if stored.already_archived {
                info!(hash = %stored.content_hash, "page unchanged since last archive");
            }

            let drafts = adapter
                .parse(spec, page)
                .with_context(|| format!("parsing {}", spec.source_id))?;
            tally.drafts_parsed += drafts.len() as i64;

            for draft in &drafts {
                match self.db.upsert_event(draft).await? {
                    UpsertOutcome::Inserted { .. } => tally.inserted += 1,
                    UpsertOutcome::Updated { .. } => tally.updated += 1,
                    UpsertOutcome::Unchanged { .. } => tally.unchanged += 1,
                }
            }
        }
        Ok(tally)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once().await {
                    error!(error = %err, "scheduled sync run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Default)]
struct SourceTally {
    drafts_parsed: i64,
    inserted: i64,
    updated: i64,
    unchanged: i64,
}

/// Duplicate pass over the canonical events in a window. Clusters are
/// collapsed onto their elected canonical row; borderline pairs land in the
/// review queue. Returns (merged, queued) counts.
pub async fn dedupe_pass(
    db: &Db,
    engine: &DedupeEngine,
    priorities: &HashMap<String, i64>,
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(i64, i64)> {
    let events = db.events_between(window_from, window_to).await?;
    let candidates: Vec<Candidate> = events
        .iter()
        .map(|event| {
            let priority = priorities.get(&event.source_id).copied().unwrap_or(100);
            Candidate::from_event(event, priority)
        })
        .collect();

    let outcome = engine.run(&candidates);

    let mut merged = 0i64;
    for cluster in &outcome.clusters {
        let Some(canonical_id) = candidates[cluster.canonical].id else {
            continue;
        };
        let duplicates: Vec<Uuid> = cluster
            .members
            .iter()
            .filter(|&&m| m != cluster.canonical)
            .filter_map(|&m| candidates[m].id)
            .collect();
        merged += db.mark_duplicates(canonical_id, &duplicates).await? as i64;
    }

    let mut queued = 0i64;
    for pair in &outcome.review_pairs {
        let (Some(a), Some(b)) = (candidates[pair.left].id, candidates[pair.right].id) else {
            continue;
        };
        db.queue_review(a, b, pair.score, pair.strategy.as_str(), now)
            .await?;
        queued += 1;
    }

    Ok((merged, queued))
}

fn kind_label(spec: &SourceSpec) -> &'static str {
    match spec.kind {
        kultur_adapters::SourceKind::Html => "html",
        kultur_adapters::SourceKind::Json => "json",
        kultur_adapters::SourceKind::Rss => "rss",
        kultur_adapters::SourceKind::Ticketing => "ticketing",
    }
}
