//! Concrete HTTP clients for the public CNPJ registry providers.

mod cnpja_open;
mod cnpjws;
mod receitaws;

pub use cnpja_open::CnpjaOpen;
pub use cnpjws::CnpjWs;
pub use receitaws::ReceitaWs;

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{Client, StatusCode};

use crate::provider::ProviderOutcome;

pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .user_agent(concat!("cnpj-enrichment/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .gzip(true)
        .build()
        .unwrap_or_default()
}

/// Classify a non-200 HTTP status into a provider outcome.
pub(crate) fn outcome_for_status(status: StatusCode) -> ProviderOutcome {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderOutcome::RateLimited
    } else if status == StatusCode::NOT_FOUND {
        ProviderOutcome::NotFound
    } else if status.is_client_error() {
        ProviderOutcome::Invalid(format!("provider rejected request: HTTP {status}"))
    } else {
        ProviderOutcome::TransientError(format!("provider error: HTTP {status}"))
    }
}

/// Classify a reqwest transport failure. Everything here is retriable.
pub(crate) fn outcome_for_transport_error(error: &reqwest::Error) -> ProviderOutcome {
    if error.is_timeout() {
        ProviderOutcome::TransientError("request timed out".to_string())
    } else {
        ProviderOutcome::TransientError(format!("request failed: {error}"))
    }
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Providers publish dates either ISO or in the Brazilian day-first form.
pub(crate) fn parse_provider_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
}
