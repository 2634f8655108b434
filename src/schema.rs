//! Database row types for the enrichment queue.
//!
//! Two tables back the system: `cnpj_jobs` tracks the lifecycle of every
//! submitted CNPJ, `cnpj_companies` stores the normalized registry data.
//! When a CNPJ has been resubmitted after a terminal failure it may own
//! several job rows; the newest one is authoritative.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::cnpj::Cnpj;

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker; `updated_at` marks the claim time.
    Processing,
    /// Enriched; a company row exists for this CNPJ.
    Completed,
    /// Permanent failure; see `error_message`.
    Error,
    /// No provider capacity was left after the retry budget. Terminal until
    /// an admin restart re-queues it.
    RateLimited,
}

impl JobStatus {
    /// Canonical database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for status strings the schema does not know.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct UnknownJobStatus(pub String);

impl TryFrom<String> for JobStatus {
    type Error = UnknownJobStatus;

    fn try_from(value: String) -> Result<Self, UnknownJobStatus> {
        match value.as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            "rate_limited" => Ok(JobStatus::RateLimited),
            _ => Err(UnknownJobStatus(value)),
        }
    }
}

/// One job row in `cnpj_jobs`.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Row identifier.
    pub id: i64,
    /// The CNPJ this job enriches.
    #[sqlx(try_from = "String")]
    pub cnpj: Cnpj,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    /// Failure detail, set for `error` and `rate_limited`.
    pub error_message: Option<String>,
    /// Attempts consumed beyond the first.
    pub retry_count: i32,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every status transition.
    pub updated_at: DateTime<Utc>,
}

/// Compact job view for status snapshots.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecentJob {
    /// Canonical CNPJ digits.
    pub cnpj: String,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    /// Failure detail, if any.
    pub error_message: Option<String>,
    /// Last transition time.
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

/// Aggregate job counts by status, over the newest row per CNPJ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Number of distinct CNPJs tracked.
    pub total: i64,
    /// CNPJs waiting for a worker.
    pub queued: i64,
    /// CNPJs currently claimed.
    pub processing: i64,
    /// CNPJs with a company record.
    pub completed: i64,
    /// CNPJs that failed permanently.
    pub error: i64,
    /// CNPJs parked after exhausting provider capacity.
    pub rate_limited: i64,
}

/// One normalized company row in `cnpj_companies`.
#[derive(Debug, Clone, FromRow)]
pub struct CompanyRecord {
    /// Row identifier.
    pub id: i64,
    /// Unique CNPJ this record describes.
    pub cnpj: String,
    /// Registered legal name.
    pub legal_name: Option<String>,
    /// Trade name.
    pub trade_name: Option<String>,
    /// Registration status text.
    pub registration_status: Option<String>,
    /// Street line of the registered address.
    pub street: Option<String>,
    /// Street number.
    pub number: Option<String>,
    /// Address complement.
    pub details: Option<String>,
    /// City.
    pub city: Option<String>,
    /// State abbreviation.
    pub state: Option<String>,
    /// Zip code, digits only.
    pub zip_code: Option<String>,
    /// Contact e-mail.
    pub email: Option<String>,
    /// Contact phone.
    pub phone: Option<String>,
    /// Simples Nacional opt-in flag.
    pub simples_nacional: Option<bool>,
    /// Simples Nacional opt-in date.
    pub simples_nacional_since: Option<NaiveDate>,
    /// Primary activity as JSON, when the provider publishes it.
    pub main_activity: Option<Value>,
    /// Secondary activities as JSON.
    pub side_activities: Option<Value>,
    /// Ownership structure as JSON.
    pub partners: Option<Value>,
    /// Which provider produced this record.
    pub provider_name: String,
    /// Untouched provider payload.
    pub raw_data: Option<Value>,
    /// When the provider was last asked about this CNPJ.
    pub last_queried_at: DateTime<Utc>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Last time the row was written.
    pub updated_at: DateTime<Utc>,
}
