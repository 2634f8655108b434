#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cnpj;
mod config;
mod errors;
mod provider;
/// Concrete HTTP clients for the public registry providers.
pub mod providers;
mod queue;
mod rate_limiter;
mod router;
/// Database row types.
pub mod schema;
mod storage;
mod supervisor;
mod token_bucket;

/// Canonical 14-digit company identifier.
pub use self::cnpj::{Cnpj, InvalidCnpj};
/// Environment-driven configuration.
pub use self::config::{Config, ConfigError, ProviderSettings};
/// Error type for job enqueueing operations.
pub use self::errors::EnqueueError;
/// Provider capability contract and normalized data shapes.
pub use self::provider::{Activity, Address, CompanyData, Partner, Provider, ProviderOutcome};
/// Adaptive multi-provider rate limiting.
pub use self::rate_limiter::{AdaptiveRateLimiter, LimiterSettings, ProviderStatus};
/// Provider selection and fallback routing.
pub use self::router::{ProviderRouter, RouteError};
/// Durable queue state access.
pub use self::storage::{setup_database, DedupeReport, EnqueueOutcome, Store};
/// Process-wide lifecycle and admin surface.
pub use self::supervisor::{
    RestartReport, StatusSnapshot, SubmissionAck, SubmissionOutcome, Supervisor,
};
