use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cnpj::Cnpj;
use crate::router::{ProviderRouter, RouteError};
use crate::schema::JobStatus;
use crate::storage::Store;

#[derive(Debug, Clone)]
pub(crate) struct QueueSettings {
    pub(crate) max_concurrent: usize,
    pub(crate) max_retries: u32,
    pub(crate) refill_interval: Duration,
    pub(crate) reaper_interval: Duration,
    pub(crate) stuck_threshold: Duration,
}

struct QueueState {
    fifo: VecDeque<Cnpj>,
    // CNPJs either waiting in `fifo` or held by a worker. Keeps the refill
    // task from re-adding work that is already in memory.
    tracked: HashSet<Cnpj>,
}

/// In-memory work queue with a bounded worker pool.
///
/// Workers pull CNPJs from a FIFO fed by [`crate::Supervisor::submit`], the
/// periodic refill task and the stuck-job reaper. Every `route` start is
/// globally paced so the aggregate request rate never exceeds the combined
/// provider limits.
pub(crate) struct JobQueue {
    store: Store,
    router: ProviderRouter,
    settings: QueueSettings,
    // 60s divided by the combined per-minute limit of all providers.
    min_interval: Duration,
    refill_high_water: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    next_start: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl JobQueue {
    pub(crate) fn new(
        store: Store,
        router: ProviderRouter,
        settings: QueueSettings,
        total_limit_per_minute: u32,
    ) -> Arc<Self> {
        let total = total_limit_per_minute.max(1);
        Arc::new(Self {
            store,
            router,
            settings,
            min_interval: Duration::from_secs_f64(60.0 / f64::from(total)),
            refill_high_water: 2 * total as usize,
            state: Mutex::new(QueueState {
                fifo: VecDeque::new(),
                tracked: HashSet::new(),
            }),
            notify: Notify::new(),
            next_start: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Spawn the worker pool plus the refill and reaper tasks.
    pub(crate) fn start(self: &Arc<Self>) -> QueueHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (1..=self.settings.max_concurrent)
            .map(|index| self.spawn_worker(index, shutdown_rx.clone()))
            .collect();

        let mut maintenance = Vec::new();
        let queue = Arc::clone(self);
        let rx = shutdown_rx.clone();
        maintenance.push(tokio::spawn(
            async move { queue.run_refill(rx).await }.instrument(info_span!("refill")),
        ));

        let queue = Arc::clone(self);
        maintenance.push(tokio::spawn(
            async move { queue.run_reaper(shutdown_rx).await }.instrument(info_span!("reaper")),
        ));

        QueueHandle {
            shutdown: shutdown_tx,
            workers,
            maintenance,
        }
    }

    fn spawn_worker(self: &Arc<Self>, index: usize, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let name = format!("enrichment-worker-{index}");
        info!(worker.name = %name, "Starting worker…");
        let span = info_span!("worker", worker.name = %name);
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run_worker(shutdown).await }.instrument(span))
    }

    /// Add CNPJs to the in-memory queue, skipping ones already tracked.
    pub(crate) async fn push_many(&self, cnpjs: impl IntoIterator<Item = Cnpj>) -> usize {
        let added = {
            let mut state = self.state.lock().await;
            let mut added = 0;
            for cnpj in cnpjs {
                if state.tracked.insert(cnpj.clone()) {
                    state.fifo.push_back(cnpj);
                    added += 1;
                }
            }
            added
        };
        if added > 0 {
            self.notify.notify_waiters();
        }
        added
    }

    /// Pull persisted `queued` rows into memory when the backlog runs low.
    pub(crate) async fn refill_once(&self) -> usize {
        let backlog =
            { self.state.lock().await.fifo.len() } + self.in_flight.load(Ordering::SeqCst);
        if backlog >= self.refill_high_water {
            return 0;
        }
        match self
            .store
            .load_pending(Some(self.refill_high_water as i64))
            .await
        {
            Ok(pending) => {
                let added = self.push_many(pending).await;
                if added > 0 {
                    debug!(added, "Refilled queue from storage");
                }
                added
            }
            Err(error) => {
                warn!(%error, "Failed to load pending jobs");
                0
            }
        }
    }

    /// Return stale `processing` rows to `queued` and re-admit them.
    pub(crate) async fn reap_once(&self) -> usize {
        match self.store.reset_stuck(self.settings.stuck_threshold).await {
            Ok(rescued) => {
                if rescued.is_empty() {
                    return 0;
                }
                warn!(count = rescued.len(), "Rescued stuck jobs back to queued");
                self.push_many(rescued).await
            }
            Err(error) => {
                warn!(%error, "Reaper query failed");
                0
            }
        }
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let Some(cnpj) = self.next_cnpj(&mut shutdown).await else {
                break;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let result = AssertUnwindSafe(self.process(&cnpj)).catch_unwind().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Err(panic) = result {
                // The job row stays `processing`; the reaper rescues it once
                // it crosses the stuck threshold.
                error!(
                    %cnpj,
                    panic = %panic_message(&*panic),
                    "Worker panicked while processing"
                );
                self.forget(&cnpj).await;
            }
        }
        debug!("Worker shutting down");
    }

    async fn process(&self, cnpj: &Cnpj) {
        let retry_count = match self.store.claim(cnpj).await {
            Ok(Some(retry_count)) => retry_count,
            Ok(None) => {
                debug!(%cnpj, "Claim skipped; job already taken or finished");
                self.forget(cnpj).await;
                return;
            }
            Err(error) => {
                warn!(%cnpj, %error, "Failed to claim job");
                self.forget(cnpj).await;
                return;
            }
        };

        self.pace().await;

        match self.router.route(cnpj).await {
            Ok((provider_name, data)) => {
                match self.store.mark_completed(cnpj, &provider_name, &data).await {
                    Ok(()) => {
                        info!(%cnpj, provider = %provider_name, "CNPJ enriched");
                        self.forget(cnpj).await;
                    }
                    Err(error) => {
                        // Row stays `processing` until the reaper re-queues
                        // it, but retrying from memory is usually faster.
                        error!(%cnpj, %error, "Failed to persist enrichment; re-queueing");
                        self.reenqueue(cnpj.clone()).await;
                    }
                }
            }
            Err(RouteError::NotFound) => {
                self.finish(cnpj, JobStatus::Error, "CNPJ not found").await;
            }
            Err(RouteError::Invalid(cause)) => {
                self.finish(cnpj, JobStatus::Error, &cause).await;
            }
            Err(RouteError::NoProviderAvailable) => {
                self.retry_or_park(
                    cnpj,
                    retry_count,
                    JobStatus::RateLimited,
                    "no provider available within the wait budget",
                )
                .await;
            }
            Err(RouteError::AllProvidersFailed(cause)) => {
                self.retry_or_park(cnpj, retry_count, JobStatus::Error, &cause)
                    .await;
            }
        }
    }

    async fn retry_or_park(
        &self,
        cnpj: &Cnpj,
        retry_count: i32,
        park_as: JobStatus,
        message: &str,
    ) {
        let budget = i32::try_from(self.settings.max_retries).unwrap_or(i32::MAX);
        if retry_count < budget {
            match self.store.requeue_for_retry(cnpj).await {
                Ok(Some(new_retry)) => {
                    let backoff = backoff_for(new_retry);
                    debug!(
                        %cnpj,
                        retry = new_retry,
                        backoff_secs = backoff.as_secs(),
                        "Provider capacity exhausted; backing off before retry"
                    );
                    sleep(backoff).await;
                    self.reenqueue(cnpj.clone()).await;
                }
                Ok(None) => self.forget(cnpj).await,
                Err(error) => {
                    warn!(%cnpj, %error, "Failed to requeue for retry");
                    self.forget(cnpj).await;
                }
            }
        } else {
            self.finish(cnpj, park_as, message).await;
        }
    }

    async fn finish(&self, cnpj: &Cnpj, status: JobStatus, message: &str) {
        let result = match status {
            JobStatus::RateLimited => self.store.mark_rate_limited(cnpj, message).await,
            _ => self.store.mark_error(cnpj, message).await,
        };
        if let Err(error) = result {
            warn!(%cnpj, %error, "Failed to record terminal status");
        } else {
            debug!(%cnpj, status = %status, message, "Job finished");
        }
        self.forget(cnpj).await;
    }

    /// Global pacing: reserve the next start slot, then sleep up to it.
    async fn pace(&self) {
        let wait = {
            let mut next_start = self.next_start.lock().await;
            let now = Instant::now();
            let wait = next_start.saturating_duration_since(now);
            *next_start = (*next_start).max(now) + self.min_interval;
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn next_cnpj(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Cnpj> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(cnpj) = self.state.lock().await.fifo.pop_front() {
                return Some(cnpj);
            }
            // Register for the wakeup before the final emptiness check so a
            // concurrent push cannot slip between check and sleep.
            let notified = self.notify.notified();
            if let Some(cnpj) = self.state.lock().await.fifo.pop_front() {
                return Some(cnpj);
            }
            tokio::select! {
                _ = notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    /// Keep the CNPJ tracked and put it back at the end of the FIFO.
    async fn reenqueue(&self, cnpj: Cnpj) {
        {
            let mut state = self.state.lock().await;
            state.tracked.insert(cnpj.clone());
            state.fifo.push_back(cnpj);
        }
        self.notify.notify_waiters();
    }

    async fn forget(&self, cnpj: &Cnpj) {
        self.state.lock().await.tracked.remove(cnpj);
    }

    async fn run_refill(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.refill_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refill_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to the running worker pool and maintenance tasks.
pub(crate) struct QueueHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    maintenance: Vec<JoinHandle<()>>,
}

impl QueueHandle {
    /// Respawn worker tasks that have died.
    ///
    /// Returns the number of workers respawned, or `None` when shutdown has
    /// begun and the pool is intentionally stopped.
    pub(crate) fn ensure_workers(&mut self, queue: &Arc<JobQueue>) -> Option<usize> {
        if *self.shutdown.borrow() {
            return None;
        }
        let mut respawned = 0;
        for (slot, handle) in self.workers.iter_mut().enumerate() {
            if handle.is_finished() {
                warn!(worker.index = slot + 1, "Worker task exited; respawning");
                *handle = queue.spawn_worker(slot + 1, self.shutdown.subscribe());
                respawned += 1;
            }
        }
        Some(respawned)
    }

    /// Stop admitting new work and wait for in-flight jobs to finish.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let handles = self.workers.into_iter().chain(self.maintenance);
        join_all(handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Queue task panicked during shutdown");
            }
        });
    }
}

/// Exponential backoff for the nth retry: 2, 4, 8, then capped at 8 seconds.
fn backoff_for(retry: i32) -> Duration {
    let exponent = u32::try_from(retry).unwrap_or(0).min(3);
    Duration::from_secs((1u64 << exponent).min(8))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
