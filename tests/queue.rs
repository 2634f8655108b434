#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use claims::{assert_none, assert_some};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use insta::assert_compact_json_snapshot;
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::time::{sleep, Instant};

use cnpj_enrichment::schema::JobStatus;
use cnpj_enrichment::{
    setup_database, Cnpj, CompanyData, Config, EnqueueOutcome, Provider, ProviderOutcome,
    ProviderSettings, Store, SubmissionOutcome, Supervisor,
};

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the store,
    /// pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(Store, PgPool, ContainerAsync<Postgres>)>
    {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((Store::new(pool.clone()), pool, container))
    }

    /// Config tuned so integration runs finish in seconds: generous provider
    /// limits (tiny global pacing interval) and short maintenance intervals.
    pub(super) fn fast_config(providers: &[(&str, u32)]) -> Config {
        Config {
            providers: providers
                .iter()
                .map(|(name, limit)| ProviderSettings {
                    name: (*name).to_string(),
                    enabled: true,
                    limit_per_minute: *limit,
                })
                .collect(),
            max_concurrent: 2,
            cooldown_base: Duration::from_secs(5),
            per_request_wait: Duration::from_millis(500),
            refill_interval: Duration::from_millis(500),
            reaper_interval: Duration::from_millis(500),
            ..Config::default()
        }
    }

    pub(super) fn cnpj(digits: &str) -> Cnpj {
        Cnpj::parse(digits).expect("valid test CNPJ")
    }

    /// Insert a job row directly, backdated by `age_secs`.
    pub(super) async fn insert_job(
        pool: &PgPool,
        cnpj: &str,
        status: &str,
        age_secs: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO cnpj_jobs (cnpj, status, created_at, updated_at) \
             VALUES ($1, $2, NOW() - make_interval(secs => $3), NOW() - make_interval(secs => $3))",
        )
        .bind(cnpj)
        .bind(status)
        .bind(age_secs)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum StubBehavior {
    Ok,
    RateLimited,
    Transient,
}

struct StubProvider {
    name: &'static str,
    behavior: StubBehavior,
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn query<'a>(&'a self, cnpj: &'a Cnpj) -> BoxFuture<'a, ProviderOutcome> {
        let outcome = match self.behavior {
            StubBehavior::Ok => ProviderOutcome::Ok(CompanyData {
                legal_name: Some(format!("COMPANY {cnpj}")),
                ..CompanyData::default()
            }),
            StubBehavior::RateLimited => ProviderOutcome::RateLimited,
            StubBehavior::Transient => {
                ProviderOutcome::TransientError("stub transient failure".to_string())
            }
        };
        async move { outcome }.boxed()
    }
}

fn stub(name: &'static str, behavior: StubBehavior) -> Arc<dyn Provider> {
    Arc::new(StubProvider { name, behavior })
}

#[tokio::test]
async fn setup_database_creates_tables() -> anyhow::Result<()> {
    let (_store, pool, _container) = test_utils::setup_test_db().await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_name IN ('cnpj_jobs', 'cnpj_companies') \
         AND table_schema = 'public'",
    )
    .fetch_one(&pool)
    .await?;

    assert_eq!(table_count, 2, "expected cnpj_jobs and cnpj_companies");
    Ok(())
}

#[tokio::test]
async fn enqueue_is_idempotent() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;
    let cnpj = test_utils::cnpj("11222333000181");

    assert_eq!(store.enqueue(&cnpj).await?, EnqueueOutcome::Queued);
    assert_eq!(store.enqueue(&cnpj).await?, EnqueueOutcome::AlreadyPending);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cnpj_jobs WHERE cnpj = $1")
        .bind(cnpj.as_str())
        .fetch_one(&pool)
        .await?;
    assert_eq!(rows, 1);
    Ok(())
}

#[tokio::test]
async fn enqueue_reports_already_done_after_completion() -> anyhow::Result<()> {
    let (store, _pool, _container) = test_utils::setup_test_db().await?;
    let cnpj = test_utils::cnpj("11222333000181");

    store.enqueue(&cnpj).await?;
    assert_some!(store.claim(&cnpj).await?);
    store
        .mark_completed(&cnpj, "stub", &CompanyData::default())
        .await?;

    assert_eq!(store.enqueue(&cnpj).await?, EnqueueOutcome::AlreadyDone);
    Ok(())
}

#[tokio::test]
async fn claim_is_exclusive() -> anyhow::Result<()> {
    let (store, _pool, _container) = test_utils::setup_test_db().await?;
    let cnpj = test_utils::cnpj("11222333000181");

    store.enqueue(&cnpj).await?;

    let retry_count = assert_some!(store.claim(&cnpj).await?);
    assert_eq!(retry_count, 0);

    // The newest row is now `processing`; a second claim must fail.
    assert_none!(store.claim(&cnpj).await?);
    Ok(())
}

#[tokio::test]
async fn requeue_for_retry_charges_the_budget() -> anyhow::Result<()> {
    let (store, _pool, _container) = test_utils::setup_test_db().await?;
    let cnpj = test_utils::cnpj("11222333000181");

    store.enqueue(&cnpj).await?;
    assert_eq!(assert_some!(store.claim(&cnpj).await?), 0);
    assert_eq!(assert_some!(store.requeue_for_retry(&cnpj).await?), 1);
    assert_eq!(assert_some!(store.claim(&cnpj).await?), 1);
    assert_eq!(assert_some!(store.requeue_for_retry(&cnpj).await?), 2);

    // Not `processing` anymore, so there is nothing to requeue.
    assert_none!(store.requeue_for_retry(&cnpj).await?);
    Ok(())
}

#[tokio::test]
async fn completion_persists_the_company_record() -> anyhow::Result<()> {
    let (store, _pool, _container) = test_utils::setup_test_db().await?;
    let cnpj = test_utils::cnpj("11222333000181");

    store.enqueue(&cnpj).await?;
    assert_some!(store.claim(&cnpj).await?);
    let data = CompanyData {
        legal_name: Some("EMPRESA EXEMPLO LTDA".to_string()),
        ..CompanyData::default()
    };
    store.mark_completed(&cnpj, "stub", &data).await?;

    let company = assert_some!(store.find_company(&cnpj).await?);
    assert_eq!(company.legal_name.as_deref(), Some("EMPRESA EXEMPLO LTDA"));
    assert_eq!(company.provider_name, "stub");

    let job = assert_some!(store.latest_job(&cnpj).await?);
    assert_eq!(job.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn completing_over_an_existing_record_is_not_an_error() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;
    let cnpj = test_utils::cnpj("11222333000181");

    // A prior run already enriched this CNPJ.
    sqlx::query("INSERT INTO cnpj_companies (cnpj, legal_name, provider_name) VALUES ($1, $2, $3)")
        .bind(cnpj.as_str())
        .bind("OLD NAME")
        .bind("old_provider")
        .execute(&pool)
        .await?;

    store.enqueue(&cnpj).await?;
    assert_some!(store.claim(&cnpj).await?);
    let data = CompanyData {
        legal_name: Some("NEW NAME".to_string()),
        ..CompanyData::default()
    };
    store.mark_completed(&cnpj, "new_provider", &data).await?;

    let job = assert_some!(store.latest_job(&cnpj).await?);
    assert_eq!(job.status, JobStatus::Completed);

    // Exactly one company row survives, and the first enrichment wins.
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cnpj_companies WHERE cnpj = $1")
        .bind(cnpj.as_str())
        .fetch_one(&pool)
        .await?;
    assert_eq!(rows, 1);

    let company = assert_some!(store.find_company(&cnpj).await?);
    assert_eq!(company.legal_name.as_deref(), Some("OLD NAME"));
    assert_eq!(company.provider_name, "old_provider");
    Ok(())
}

#[tokio::test]
async fn reset_stuck_rescues_abandoned_jobs() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    test_utils::insert_job(&pool, "11222333000181", "processing", 300.0).await?;
    test_utils::insert_job(&pool, "11444777000161", "processing", 10.0).await?;

    let rescued = store.reset_stuck(Duration::from_secs(180)).await?;
    assert_eq!(rescued.len(), 1);
    assert_eq!(rescued[0].as_str(), "11222333000181");

    let stale = assert_some!(store.latest_job(&test_utils::cnpj("11222333000181")).await?);
    assert_eq!(stale.status, JobStatus::Queued);

    let fresh = assert_some!(store.latest_job(&test_utils::cnpj("11444777000161")).await?);
    assert_eq!(fresh.status, JobStatus::Processing);
    Ok(())
}

#[tokio::test]
async fn load_pending_returns_oldest_first() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    test_utils::insert_job(&pool, "11222333000181", "queued", 30.0).await?;
    test_utils::insert_job(&pool, "11444777000161", "queued", 300.0).await?;
    test_utils::insert_job(&pool, "00000000000191", "completed", 600.0).await?;

    let pending = store.load_pending(None).await?;
    let digits: Vec<&str> = pending.iter().map(Cnpj::as_str).collect();
    assert_eq!(digits, vec!["11444777000161", "11222333000181"]);

    let limited = store.load_pending(Some(1)).await?;
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].as_str(), "11444777000161");
    Ok(())
}

#[tokio::test]
async fn requeue_rate_limited_unparks_jobs() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    test_utils::insert_job(&pool, "11222333000181", "rate_limited", 60.0).await?;
    test_utils::insert_job(&pool, "11444777000161", "error", 60.0).await?;

    let unparked = store.requeue_rate_limited().await?;
    assert_eq!(unparked.len(), 1);
    assert_eq!(unparked[0].as_str(), "11222333000181");

    // Errors stay parked; only rate_limited rows move.
    let errored = assert_some!(store.latest_job(&test_utils::cnpj("11444777000161")).await?);
    assert_eq!(errored.status, JobStatus::Error);
    Ok(())
}

#[tokio::test]
async fn counts_aggregate_the_newest_row_per_cnpj() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    // An old error row superseded by a completed one: only the newest counts.
    test_utils::insert_job(&pool, "11222333000181", "error", 600.0).await?;
    test_utils::insert_job(&pool, "11222333000181", "completed", 60.0).await?;
    test_utils::insert_job(&pool, "11444777000161", "queued", 90.0).await?;

    let counts = store.count_by_status().await?;
    assert_compact_json_snapshot!(counts, @r#"{"total": 2, "queued": 1, "processing": 0, "completed": 1, "error": 0, "rate_limited": 0}"#);

    let recent = store.recent_jobs(100).await?;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn dedupe_duplicates_is_idempotent() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    test_utils::insert_job(&pool, "11222333000181", "error", 600.0).await?;
    test_utils::insert_job(&pool, "11222333000181", "completed", 60.0).await?;
    test_utils::insert_job(&pool, "11444777000161", "queued", 60.0).await?;

    let first = store.dedupe_duplicates().await?;
    assert_eq!(first.removed_job_records, 1);
    assert_eq!(first.removed_company_records, 0);

    let second = store.dedupe_duplicates().await?;
    assert_eq!(second.removed_job_records, 0);
    assert_eq!(second.removed_company_records, 0);

    let survivor = assert_some!(store.latest_job(&test_utils::cnpj("11222333000181")).await?);
    assert_eq!(survivor.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn happy_path_enriches_a_batch() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    let config = test_utils::fast_config(&[("stub", 600)]);
    let supervisor =
        Supervisor::start_with_providers(config, pool, vec![stub("stub", StubBehavior::Ok)])
            .await?;

    let acks = supervisor
        .submit(&[
            "11.222.333/0001-81".to_string(),
            "11444777000161".to_string(),
            "123".to_string(),
        ])
        .await?;
    assert_eq!(acks[0].outcome, SubmissionOutcome::Queued);
    assert_eq!(acks[1].outcome, SubmissionOutcome::Queued);
    assert_eq!(acks[2].outcome, SubmissionOutcome::Invalid);

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = supervisor.status_snapshot().await?;
        if snapshot.counts.completed == 2 {
            assert_eq!(snapshot.counts.queued, 0);
            assert_eq!(snapshot.counts.processing, 0);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for completion: {snapshot:?}"
        );
        sleep(Duration::from_millis(100)).await;
    }

    let company = assert_some!(
        store
            .find_company(&test_utils::cnpj("11222333000181"))
            .await?
    );
    assert_eq!(company.provider_name, "stub");
    assert_eq!(company.legal_name.as_deref(), Some("COMPANY 11222333000181"));

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_submission_is_acknowledged_not_duplicated() -> anyhow::Result<()> {
    let (_store, pool, _container) = test_utils::setup_test_db().await?;

    let config = test_utils::fast_config(&[("stub", 600)]);
    let supervisor =
        Supervisor::start_with_providers(config, pool.clone(), vec![stub("stub", StubBehavior::Ok)])
            .await?;

    let first = supervisor.enqueue("11222333000181").await?;
    assert_eq!(first, EnqueueOutcome::Queued);

    // Immediately after: either still pending or already finished, but a new
    // job row is never created.
    let second = supervisor.enqueue("11222333000181").await?;
    assert!(matches!(
        second,
        EnqueueOutcome::AlreadyPending | EnqueueOutcome::AlreadyDone
    ));

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cnpj_jobs WHERE cnpj = $1")
        .bind("11222333000181")
        .fetch_one(&pool)
        .await?;
    assert_eq!(rows, 1);

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn overloaded_provider_falls_back_to_healthy_one() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    let config = test_utils::fast_config(&[("flaky", 600), ("steady", 600)]);
    let supervisor = Supervisor::start_with_providers(
        config,
        pool,
        vec![
            stub("flaky", StubBehavior::RateLimited),
            stub("steady", StubBehavior::Ok),
        ],
    )
    .await?;

    supervisor.submit(&["11222333000181".to_string()]).await?;

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = supervisor.status_snapshot().await?;
        if snapshot.counts.completed == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for fallback completion: {snapshot:?}"
        );
        sleep(Duration::from_millis(100)).await;
    }

    // Only the healthy provider can have produced the record.
    let company = assert_some!(
        store
            .find_company(&test_utils::cnpj("11222333000181"))
            .await?
    );
    assert_eq!(company.provider_name, "steady");

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transient_failures_exhaust_into_error() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    let mut config = test_utils::fast_config(&[("stub", 600)]);
    config.max_retries = 0;
    let supervisor =
        Supervisor::start_with_providers(config, pool, vec![stub("stub", StubBehavior::Transient)])
            .await?;

    supervisor.submit(&["11222333000181".to_string()]).await?;

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = supervisor.status_snapshot().await?;
        if snapshot.counts.error == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for terminal error: {snapshot:?}"
        );
        sleep(Duration::from_millis(100)).await;
    }

    let job = assert_some!(store.latest_job(&test_utils::cnpj("11222333000181")).await?);
    assert_eq!(job.status, JobStatus::Error);
    let message = assert_some!(job.error_message);
    assert!(message.contains("stub"), "message names the provider: {message}");

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn provider_exhaustion_parks_job_as_rate_limited() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    // One retry: the first attempt burns the provider into cooldown, the
    // second finds nobody available within the wait budget and parks.
    let mut config = test_utils::fast_config(&[("stub", 600)]);
    config.max_retries = 1;
    let supervisor = Supervisor::start_with_providers(
        config,
        pool,
        vec![stub("stub", StubBehavior::RateLimited)],
    )
    .await?;

    supervisor.submit(&["11222333000181".to_string()]).await?;

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let snapshot = supervisor.status_snapshot().await?;
        if snapshot.counts.rate_limited == 1 || snapshot.counts.error == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for the job to park: {snapshot:?}"
        );
        sleep(Duration::from_millis(100)).await;
    }

    let job = assert_some!(store.latest_job(&test_utils::cnpj("11222333000181")).await?);
    assert!(matches!(
        job.status,
        JobStatus::RateLimited | JobStatus::Error
    ));

    // Restart re-admits parked work.
    let report = supervisor.restart_queue().await?;
    assert!(report.restarted);

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn boot_recovers_pending_and_stuck_jobs() -> anyhow::Result<()> {
    let (store, pool, _container) = test_utils::setup_test_db().await?;

    // State left behind by a killed process: still-queued work plus a claim
    // that never finished.
    test_utils::insert_job(&pool, "11222333000181", "queued", 120.0).await?;
    test_utils::insert_job(&pool, "11444777000161", "processing", 300.0).await?;

    let config = test_utils::fast_config(&[("stub", 600)]);
    let supervisor =
        Supervisor::start_with_providers(config, pool, vec![stub("stub", StubBehavior::Ok)])
            .await?;

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = supervisor.status_snapshot().await?;
        if snapshot.counts.completed == 2 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for recovery: {snapshot:?}"
        );
        sleep(Duration::from_millis(100)).await;
    }

    assert_some!(store.find_company(&test_utils::cnpj("11222333000181")).await?);
    assert_some!(store.find_company(&test_utils::cnpj("11444777000161")).await?);

    supervisor.shutdown().await;
    Ok(())
}
