use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cnpj::Cnpj;
use crate::config::Config;
use crate::errors::EnqueueError;
use crate::provider::Provider;
use crate::providers::{CnpjaOpen, CnpjWs, ReceitaWs};
use crate::queue::{JobQueue, QueueHandle, QueueSettings};
use crate::rate_limiter::{AdaptiveRateLimiter, LimiterSettings, ProviderStatus};
use crate::router::ProviderRouter;
use crate::schema::{RecentJob, StatusCounts};
use crate::storage::{DedupeReport, EnqueueOutcome, Store};

/// Snapshot `recent` is capped at this many jobs.
const RECENT_LIMIT: i64 = 100;

/// Per-CNPJ acknowledgement for a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionAck {
    /// The identifier exactly as submitted.
    pub cnpj: String,
    /// What happened to it.
    pub outcome: SubmissionOutcome,
}

/// Outcome of submitting one CNPJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Accepted; a new job was created.
    Queued,
    /// A job for this CNPJ is already queued or processing.
    AlreadyPending,
    /// This CNPJ was already enriched.
    AlreadyDone,
    /// Not a valid 14-digit CNPJ.
    Invalid,
}

impl From<EnqueueOutcome> for SubmissionOutcome {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Queued => SubmissionOutcome::Queued,
            EnqueueOutcome::AlreadyPending => SubmissionOutcome::AlreadyPending,
            EnqueueOutcome::AlreadyDone => SubmissionOutcome::AlreadyDone,
        }
    }
}

/// Durable queue state as seen by callers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Counts by status over the newest job row per CNPJ.
    #[serde(flatten)]
    pub counts: StatusCounts,
    /// Most recently touched jobs, newest first, at most 100.
    pub recent: Vec<RecentJob>,
}

/// Result of an administrative queue restart.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RestartReport {
    /// Whether the worker pool is running after this call. Dead worker
    /// tasks are respawned; `false` only when shutdown has already begun.
    pub restarted: bool,
    /// CNPJs admitted into the in-memory queue by this restart.
    pub loaded_count: u64,
}

/// Process-wide lifecycle owner.
///
/// Starts the persistent store, the adaptive rate limiter and the job queue
/// in that order, heals state left over from a previous run, and exposes the
/// administrative surface (submit, snapshot, restart, duplicate cleanup).
pub struct Supervisor {
    store: Store,
    limiter: Arc<AdaptiveRateLimiter>,
    queue: Arc<JobQueue>,
    handle: Mutex<QueueHandle>,
}

impl Supervisor {
    /// Start with the built-in HTTP provider clients.
    pub async fn start(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        let timeout = config.http_timeout;
        let clients: Vec<Arc<dyn Provider>> = vec![
            Arc::new(ReceitaWs::new(timeout)),
            Arc::new(CnpjWs::new(timeout)),
            Arc::new(CnpjaOpen::new(timeout)),
        ];
        Self::start_with_providers(config, pool, clients).await
    }

    /// Start with caller-supplied provider clients.
    ///
    /// Only clients whose name matches an enabled [`crate::ProviderSettings`]
    /// entry participate; at least one must.
    pub async fn start_with_providers(
        config: Config,
        pool: PgPool,
        clients: Vec<Arc<dyn Provider>>,
    ) -> anyhow::Result<Self> {
        let mut active: Vec<Arc<dyn Provider>> = Vec::new();
        let mut limits: Vec<(String, u32)> = Vec::new();
        for client in clients {
            let Some(settings) = config
                .enabled_providers()
                .find(|p| p.name == client.name())
            else {
                continue;
            };
            info!(
                provider = client.name(),
                limit_per_minute = settings.limit_per_minute,
                "Provider enabled"
            );
            limits.push((settings.name.clone(), settings.limit_per_minute));
            active.push(client);
        }
        anyhow::ensure!(
            !active.is_empty(),
            "at least one provider must be enabled and have a client"
        );

        let store = Store::new(pool);
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            limits,
            LimiterSettings {
                cooldown_base: config.cooldown_base,
                cooldown_max: config.cooldown_max,
                safety_factor_low: config.safety_factor_low,
                safety_factor_high: config.safety_factor_high,
                safety_threshold: config.safety_threshold,
            },
        ));
        let router = ProviderRouter::new(active, Arc::clone(&limiter), config.per_request_wait);
        let queue = JobQueue::new(
            store.clone(),
            router,
            QueueSettings {
                max_concurrent: config.max_concurrent,
                max_retries: config.max_retries,
                refill_interval: config.refill_interval,
                reaper_interval: config.reaper_interval,
                stuck_threshold: config.stuck_threshold,
            },
            limiter.total_limit_per_minute(),
        );

        if config.auto_restart_queue {
            let rescued = queue.reap_once().await;
            let pending = store.load_pending(None).await?;
            let loaded = queue.push_many(pending).await;
            info!(loaded, rescued, "Recovered queue state from storage");
        }

        let handle = queue.start();
        info!("Enrichment queue started");

        Ok(Self {
            store,
            limiter,
            queue,
            handle: Mutex::new(handle),
        })
    }

    /// Submit a single identifier.
    pub async fn enqueue(&self, raw: &str) -> Result<EnqueueOutcome, EnqueueError> {
        let cnpj = Cnpj::parse(raw)?;
        let outcome = self.store.enqueue(&cnpj).await?;
        if outcome == EnqueueOutcome::Queued {
            self.queue.push_many([cnpj]).await;
        }
        Ok(outcome)
    }

    /// Submit a batch of identifiers, acknowledging each one.
    ///
    /// Malformed identifiers come back as [`SubmissionOutcome::Invalid`];
    /// only infrastructure failures abort the batch.
    pub async fn submit(&self, cnpjs: &[String]) -> Result<Vec<SubmissionAck>, sqlx::Error> {
        let mut acks = Vec::with_capacity(cnpjs.len());
        for raw in cnpjs {
            let outcome = match self.enqueue(raw).await {
                Ok(outcome) => outcome.into(),
                Err(EnqueueError::InvalidCnpj(_)) => SubmissionOutcome::Invalid,
                Err(EnqueueError::Database(error)) => return Err(error),
            };
            acks.push(SubmissionAck {
                cnpj: raw.clone(),
                outcome,
            });
        }
        Ok(acks)
    }

    /// Durable counters plus the most recently touched jobs.
    pub async fn status_snapshot(&self) -> Result<StatusSnapshot, sqlx::Error> {
        let counts = self.store.count_by_status().await?;
        let recent = self.store.recent_jobs(RECENT_LIMIT).await?;
        Ok(StatusSnapshot { counts, recent })
    }

    /// Ensure the worker pool is running and re-admit parked work: respawn
    /// dead worker tasks, heal stuck rows, un-park `rate_limited` ones and
    /// reload everything still `queued`. Idempotent.
    pub async fn restart_queue(&self) -> Result<RestartReport, sqlx::Error> {
        let restarted = {
            let mut handle = self.handle.lock().await;
            match handle.ensure_workers(&self.queue) {
                Some(respawned) => {
                    if respawned > 0 {
                        warn!(respawned, "Respawned dead worker tasks");
                    }
                    true
                }
                None => false,
            }
        };

        let mut loaded = self.queue.reap_once().await;
        let unparked = self.store.requeue_rate_limited().await?;
        loaded += self.queue.push_many(unparked).await;
        let pending = self.store.load_pending(None).await?;
        loaded += self.queue.push_many(pending).await;
        info!(restarted, loaded, "Queue restart requested");
        Ok(RestartReport {
            restarted,
            loaded_count: loaded as u64,
        })
    }

    /// Drop superseded duplicate rows, keeping the newest per CNPJ.
    pub async fn cleanup_duplicates(&self) -> Result<DedupeReport, sqlx::Error> {
        self.store.dedupe_duplicates().await
    }

    /// Limiter state per provider, for diagnostics.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        self.limiter.provider_status().await
    }

    /// Direct access to the persistent store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stop admitting work and wait for in-flight jobs to reach a terminal
    /// status. Interrupted `processing` rows are healed by the reaper on the
    /// next boot.
    pub async fn shutdown(self) {
        info!("Shutting down enrichment queue…");
        self.handle.into_inner().shutdown().await;
    }
}
