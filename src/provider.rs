use chrono::NaiveDate;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cnpj::Cnpj;

/// One economic activity code (CNAE) with its description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// CNAE code as published by the provider.
    #[serde(default)]
    pub code: String,
    /// Human-readable description.
    #[serde(default)]
    pub text: String,
}

/// One partner (socio) in the company's ownership structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    /// Partner name.
    pub name: String,
    /// Role, e.g. "Sócio-Administrador". Best-effort.
    #[serde(default)]
    pub role: Option<String>,
}

/// Address components as normalized across providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Street line (logradouro).
    pub street: Option<String>,
    /// Street number.
    pub number: Option<String>,
    /// Complement (complemento).
    pub details: Option<String>,
    /// City name.
    pub city: Option<String>,
    /// State abbreviation.
    pub state: Option<String>,
    /// Zip code, digits only.
    pub zip_code: Option<String>,
}

/// Normalized company registry data, the superset of what the providers
/// publish. Fields a provider does not know come back `None`/empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyData {
    /// Registered legal name (razão social).
    pub legal_name: Option<String>,
    /// Trade name (nome fantasia).
    pub trade_name: Option<String>,
    /// Registration status text (situação cadastral).
    pub registration_status: Option<String>,
    /// Registered address.
    pub address: Address,
    /// Contact e-mail.
    pub email: Option<String>,
    /// Contact phone.
    pub phone: Option<String>,
    /// Whether the company opted into the Simples Nacional regime.
    pub simples_nacional: Option<bool>,
    /// Date the Simples Nacional option started.
    pub simples_nacional_since: Option<NaiveDate>,
    /// Primary activity. Best-effort per provider.
    pub main_activity: Option<Activity>,
    /// Secondary activities. Best-effort per provider.
    pub side_activities: Vec<Activity>,
    /// Ownership structure. Best-effort per provider.
    pub partners: Vec<Partner>,
    /// Untouched provider payload, kept for auditing.
    pub raw: Value,
}

/// Result of asking one provider about one CNPJ.
///
/// Tagged variants instead of errors so the router can pattern-match the
/// failure class uniformly.
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    /// The provider answered with usable registry data.
    Ok(CompanyData),
    /// The provider confirms this CNPJ does not exist. Permanent.
    NotFound,
    /// The provider signaled overload (429-equivalent).
    RateLimited,
    /// Network timeout, 5xx or unparseable payload. Retriable elsewhere.
    TransientError(String),
    /// The provider rejected the request itself (4xx other than 429). Permanent.
    Invalid(String),
}

/// Capability contract for one external registry data source.
///
/// Implementations perform exactly one HTTP call per `query` and classify
/// the result; retries, sleeps and provider selection are the router's job.
pub trait Provider: Send + Sync + 'static {
    /// Stable provider name used by the limiter and persisted on records.
    fn name(&self) -> &'static str;

    /// Look up a single CNPJ.
    fn query<'a>(&'a self, cnpj: &'a Cnpj) -> BoxFuture<'a, ProviderOutcome>;
}
