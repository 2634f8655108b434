use std::time::Duration;

use serde::Serialize;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use crate::cnpj::Cnpj;
use crate::provider::CompanyData;
use crate::schema::{CompanyRecord, JobRecord, JobStatus, RecentJob, StatusCounts};

/// Result of an idempotent enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new job row was created and the CNPJ should enter the queue.
    Queued,
    /// The newest job row is already `queued` or `processing`.
    AlreadyPending,
    /// The newest job row is `completed`; the data is already there.
    AlreadyDone,
}

/// Rows removed by [`Store::dedupe_duplicates`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    /// Superseded rows removed from `cnpj_jobs`.
    pub removed_job_records: u64,
    /// Superseded rows removed from `cnpj_companies`.
    pub removed_company_records: u64,
}

/// Create the queue tables if they do not exist yet.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Sole mediator of durable queue state.
///
/// Every method is its own transaction; a failure rolls back before the
/// error is surfaced, so callers never hold a session in a pending-rollback
/// state. All reads resolve the newest job row per CNPJ.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

const LATEST_JOB_ID: &str =
    "SELECT id FROM cnpj_jobs WHERE cnpj = $1 ORDER BY created_at DESC, id DESC LIMIT 1";

impl Store {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for callers that need ad-hoc reads.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotently enqueue a CNPJ.
    ///
    /// Locks the newest job row for the CNPJ so two concurrent submissions
    /// cannot both insert.
    pub async fn enqueue(&self, cnpj: &Cnpj) -> Result<EnqueueOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let latest: Option<String> = sqlx::query_scalar(
            "SELECT status FROM cnpj_jobs WHERE cnpj = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1 FOR UPDATE",
        )
        .bind(cnpj.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match latest.as_deref() {
            Some("queued") | Some("processing") => EnqueueOutcome::AlreadyPending,
            Some("completed") => EnqueueOutcome::AlreadyDone,
            _ => {
                sqlx::query("INSERT INTO cnpj_jobs (cnpj, status) VALUES ($1, 'queued')")
                    .bind(cnpj.as_str())
                    .execute(&mut *tx)
                    .await?;
                EnqueueOutcome::Queued
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Claim a queued CNPJ for processing.
    ///
    /// Returns the job's current `retry_count` when the claim succeeded, or
    /// `None` when the newest row is not `queued` anymore (another worker
    /// holds it, or it already finished).
    pub async fn claim(&self, cnpj: &Cnpj) -> Result<Option<i32>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(&format!(
            "UPDATE cnpj_jobs SET status = 'processing', updated_at = NOW() \
             WHERE id = ({LATEST_JOB_ID} FOR UPDATE SKIP LOCKED) AND status = 'queued' \
             RETURNING retry_count"
        ))
        .bind(cnpj.as_str())
        .fetch_optional(&self.pool)
        .await
    }

    /// Persist the enrichment result and complete the job, atomically.
    ///
    /// The insert deliberately does not overwrite on conflict: the first
    /// successful enrichment is authoritative. A unique-constraint violation
    /// means a prior run (or a racing worker) already wrote the record, so
    /// the job is still marked `completed` and the existing data stands.
    pub async fn mark_completed(
        &self,
        cnpj: &Cnpj,
        provider_name: &str,
        data: &CompanyData,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        match insert_company_tx(&mut tx, cnpj, provider_name, data).await {
            Ok(()) => {
                set_latest_status_tx(&mut tx, cnpj, JobStatus::Completed, None).await?;
                tx.commit().await?;
                Ok(())
            }
            Err(error) if is_unique_violation(&error) => {
                tx.rollback().await?;
                self.set_latest_status(cnpj, JobStatus::Completed, None)
                    .await
            }
            Err(error) => {
                tx.rollback().await?;
                Err(error)
            }
        }
    }

    /// Mark the newest job row as permanently failed.
    pub async fn mark_error(&self, cnpj: &Cnpj, message: &str) -> Result<(), sqlx::Error> {
        self.set_latest_status(cnpj, JobStatus::Error, Some(message))
            .await
    }

    /// Mark the newest job row as parked for lack of provider capacity.
    pub async fn mark_rate_limited(&self, cnpj: &Cnpj, message: &str) -> Result<(), sqlx::Error> {
        self.set_latest_status(cnpj, JobStatus::RateLimited, Some(message))
            .await
    }

    /// Put a claimed CNPJ back into `queued` and charge one retry.
    ///
    /// Returns the new `retry_count`, or `None` when the newest row is not
    /// `processing` (e.g. the reaper got there first).
    pub async fn requeue_for_retry(&self, cnpj: &Cnpj) -> Result<Option<i32>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(&format!(
            "UPDATE cnpj_jobs \
             SET status = 'queued', retry_count = retry_count + 1, updated_at = NOW() \
             WHERE id = ({LATEST_JOB_ID}) AND status = 'processing' \
             RETURNING retry_count"
        ))
        .bind(cnpj.as_str())
        .fetch_optional(&self.pool)
        .await
    }

    /// Return `processing` rows older than `threshold` to the queue.
    ///
    /// Row locks are skipped so the reaper never races an active claim.
    pub async fn reset_stuck(&self, threshold: Duration) -> Result<Vec<Cnpj>, sqlx::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            "UPDATE cnpj_jobs SET status = 'queued', updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM cnpj_jobs \
                 WHERE status = 'processing' \
                   AND updated_at < NOW() - make_interval(secs => $1) \
                 FOR UPDATE SKIP LOCKED \
             ) RETURNING cnpj",
        )
        .bind(threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(parse_cnpjs(rows))
    }

    /// Flip every CNPJ whose newest row is `rate_limited` back to `queued`.
    ///
    /// Administrative; used by queue restarts.
    pub async fn requeue_rate_limited(&self) -> Result<Vec<Cnpj>, sqlx::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            "UPDATE cnpj_jobs SET status = 'queued', updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM ( \
                     SELECT DISTINCT ON (cnpj) id, status FROM cnpj_jobs \
                     ORDER BY cnpj, created_at DESC, id DESC \
                 ) latest WHERE status = 'rate_limited' \
             ) RETURNING cnpj",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(parse_cnpjs(rows))
    }

    /// Oldest CNPJs whose newest row is `queued`, up to `limit` (all when
    /// `None`).
    pub async fn load_pending(&self, limit: Option<i64>) -> Result<Vec<Cnpj>, sqlx::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT cnpj FROM ( \
                 SELECT DISTINCT ON (cnpj) cnpj, status, created_at FROM cnpj_jobs \
                 ORDER BY cnpj, created_at DESC, id DESC \
             ) latest \
             WHERE status = 'queued' \
             ORDER BY created_at ASC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(parse_cnpjs(rows))
    }

    /// Aggregate counts over the newest job row per CNPJ.
    pub async fn count_by_status(&self) -> Result<StatusCounts, sqlx::Error> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM ( \
                 SELECT DISTINCT ON (cnpj) status FROM cnpj_jobs \
                 ORDER BY cnpj, created_at DESC, id DESC \
             ) latest GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.total += count;
            match status.as_str() {
                "queued" => counts.queued = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "error" => counts.error = count,
                "rate_limited" => counts.rate_limited = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Most recently touched CNPJs, newest first.
    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<RecentJob>, sqlx::Error> {
        sqlx::query_as(
            "SELECT cnpj, status, error_message, updated_at FROM ( \
                 SELECT DISTINCT ON (cnpj) cnpj, status, error_message, updated_at \
                 FROM cnpj_jobs \
                 ORDER BY cnpj, created_at DESC, id DESC \
             ) latest \
             ORDER BY updated_at DESC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// The newest job row for a CNPJ.
    pub async fn latest_job(&self, cnpj: &Cnpj) -> Result<Option<JobRecord>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, cnpj, status, error_message, retry_count, created_at, updated_at \
             FROM cnpj_jobs WHERE cnpj = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(cnpj.as_str())
        .fetch_optional(&self.pool)
        .await
    }

    /// The normalized company record for a CNPJ, if enrichment completed.
    pub async fn find_company(&self, cnpj: &Cnpj) -> Result<Option<CompanyRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM cnpj_companies WHERE cnpj = $1")
            .bind(cnpj.as_str())
            .fetch_optional(&self.pool)
            .await
    }

    /// Remove superseded rows, keeping the newest per CNPJ in both tables.
    ///
    /// Idempotent: a second run removes nothing.
    pub async fn dedupe_duplicates(&self) -> Result<DedupeReport, sqlx::Error> {
        let jobs = sqlx::query(
            "DELETE FROM cnpj_jobs a USING cnpj_jobs b \
             WHERE a.cnpj = b.cnpj AND (a.created_at, a.id) < (b.created_at, b.id)",
        )
        .execute(&self.pool)
        .await?;

        let companies = sqlx::query(
            "DELETE FROM cnpj_companies a USING cnpj_companies b \
             WHERE a.cnpj = b.cnpj AND (a.updated_at, a.id) < (b.updated_at, b.id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(DedupeReport {
            removed_job_records: jobs.rows_affected(),
            removed_company_records: companies.rows_affected(),
        })
    }

    async fn set_latest_status(
        &self,
        cnpj: &Cnpj,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "UPDATE cnpj_jobs SET status = $2, error_message = $3, updated_at = NOW() \
             WHERE id = ({LATEST_JOB_ID})"
        ))
        .bind(cnpj.as_str())
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn set_latest_status_tx(
    tx: &mut Transaction<'_, Postgres>,
    cnpj: &Cnpj,
    status: JobStatus,
    message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "UPDATE cnpj_jobs SET status = $2, error_message = $3, updated_at = NOW() \
         WHERE id = ({LATEST_JOB_ID})"
    ))
    .bind(cnpj.as_str())
    .bind(status.as_str())
    .bind(message)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_company_tx(
    tx: &mut Transaction<'_, Postgres>,
    cnpj: &Cnpj,
    provider_name: &str,
    data: &CompanyData,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO cnpj_companies ( \
             cnpj, legal_name, trade_name, registration_status, \
             street, number, details, city, state, zip_code, \
             email, phone, simples_nacional, simples_nacional_since, \
             main_activity, side_activities, partners, \
             provider_name, raw_data, last_queried_at, updated_at \
         ) VALUES ( \
             $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
             $11, $12, $13, $14, $15, $16, $17, $18, $19, NOW(), NOW() \
         )",
    )
    .bind(cnpj.as_str())
    .bind(&data.legal_name)
    .bind(&data.trade_name)
    .bind(&data.registration_status)
    .bind(&data.address.street)
    .bind(&data.address.number)
    .bind(&data.address.details)
    .bind(&data.address.city)
    .bind(&data.address.state)
    .bind(&data.address.zip_code)
    .bind(&data.email)
    .bind(&data.phone)
    .bind(data.simples_nacional)
    .bind(data.simples_nacional_since)
    .bind(data.main_activity.as_ref().map(Json))
    .bind(Json(&data.side_activities))
    .bind(Json(&data.partners))
    .bind(provider_name)
    .bind(&data.raw)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse_cnpjs(rows: Vec<String>) -> Vec<Cnpj> {
    rows.into_iter()
        .filter_map(|row| Cnpj::parse(&row).ok())
        .collect()
}
