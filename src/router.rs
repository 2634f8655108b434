use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cnpj::Cnpj;
use crate::provider::{CompanyData, Provider, ProviderOutcome};
use crate::rate_limiter::AdaptiveRateLimiter;

/// Terminal outcome of routing one CNPJ, when no provider produced data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// A healthy provider confirmed the CNPJ does not exist.
    #[error("CNPJ not found")]
    NotFound,
    /// A healthy provider rejected the request as malformed.
    #[error("{0}")]
    Invalid(String),
    /// No provider had capacity within the per-request wait budget.
    #[error("no provider available within the wait budget")]
    NoProviderAvailable,
    /// Every enabled provider rejected the request this round.
    #[error("all providers failed: {0}")]
    AllProvidersFailed(String),
}

/// Routes one CNPJ lookup through the best available provider.
///
/// The limiter decides who goes first; providers that answer with an
/// overload signal or a transient failure are dropped from the candidate
/// set for the remainder of the call and the next-best provider is tried.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    limiter: Arc<AdaptiveRateLimiter>,
    per_request_wait: Duration,
}

impl ProviderRouter {
    /// Build a router over the given providers.
    ///
    /// `per_request_wait` bounds how long a single `route` call may wait for
    /// any provider to become available.
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        limiter: Arc<AdaptiveRateLimiter>,
        per_request_wait: Duration,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            providers,
            limiter,
            per_request_wait,
        }
    }

    /// Names of all providers this router can reach.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve one CNPJ, returning the normalized record and the name of the
    /// provider that produced it.
    pub async fn route(&self, cnpj: &Cnpj) -> Result<(String, CompanyData), RouteError> {
        let mut candidates = self.provider_names();
        let mut last_failure: Option<String> = None;

        while !candidates.is_empty() {
            let Some(picked) = self
                .limiter
                .wait_for_any(self.per_request_wait, &candidates)
                .await
            else {
                return Err(RouteError::NoProviderAvailable);
            };

            let Some(provider) = self.providers.get(&picked) else {
                // Limiter and router are built from the same set; a miss here
                // means a candidate list bug, not a runtime condition.
                candidates.retain(|name| name != &picked);
                continue;
            };

            debug!(%cnpj, provider = %picked, "Querying provider");
            match provider.query(cnpj).await {
                ProviderOutcome::Ok(data) => {
                    self.limiter.on_success(&picked).await;
                    return Ok((picked, data));
                }
                ProviderOutcome::NotFound => {
                    // The provider is healthy; the CNPJ is the problem.
                    self.limiter.on_success(&picked).await;
                    return Err(RouteError::NotFound);
                }
                ProviderOutcome::Invalid(cause) => {
                    self.limiter.on_success(&picked).await;
                    return Err(RouteError::Invalid(cause));
                }
                ProviderOutcome::RateLimited => {
                    warn!(%cnpj, provider = %picked, "Provider rate limited, trying next");
                    self.limiter.on_rate_limited(&picked).await;
                    last_failure = Some(format!("{picked}: rate limited"));
                    candidates.retain(|name| name != &picked);
                }
                ProviderOutcome::TransientError(cause) => {
                    warn!(%cnpj, provider = %picked, %cause, "Provider failed, trying next");
                    self.limiter.on_transient_error(&picked).await;
                    last_failure = Some(format!("{picked}: {cause}"));
                    candidates.retain(|name| name != &picked);
                }
            }
        }

        Err(RouteError::AllProvidersFailed(
            last_failure.unwrap_or_else(|| "no providers enabled".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::LimiterSettings;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        name: &'static str,
        script: Mutex<VecDeque<ProviderOutcome>>,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, outcomes: Vec<ProviderOutcome>) -> Arc<dyn Provider> {
            Arc::new(Self {
                name,
                script: Mutex::new(outcomes.into()),
            })
        }
    }

    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn query<'a>(&'a self, _cnpj: &'a Cnpj) -> BoxFuture<'a, ProviderOutcome> {
            let outcome = self
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(ProviderOutcome::TransientError("script empty".into()));
            async move { outcome }.boxed()
        }
    }

    fn router(providers: Vec<Arc<dyn Provider>>, limits: &[(&str, u32)]) -> ProviderRouter {
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            limits.iter().map(|(n, l)| (n.to_string(), *l)),
            LimiterSettings::default(),
        ));
        ProviderRouter::new(providers, limiter, Duration::from_secs(5))
    }

    fn cnpj() -> Cnpj {
        Cnpj::parse("11222333000181").expect("valid test CNPJ")
    }

    #[tokio::test(start_paused = true)]
    async fn returns_data_with_provider_name() {
        let provider = ScriptedProvider::new(
            "api",
            vec![ProviderOutcome::Ok(CompanyData {
                legal_name: Some("EMPRESA".into()),
                ..CompanyData::default()
            })],
        );
        let router = router(vec![provider], &[("api", 60)]);

        let (name, data) = router.route(&cnpj()).await.expect("route succeeds");
        assert_eq!(name, "api");
        assert_eq!(data.legal_name.as_deref(), Some("EMPRESA"));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_first_provider_is_rate_limited() {
        // "a" always reports overload; "b" always succeeds. Whichever is
        // picked first, the call must end on "b".
        let a = ScriptedProvider::new(
            "a",
            vec![ProviderOutcome::RateLimited, ProviderOutcome::RateLimited],
        );
        let b = ScriptedProvider::new(
            "b",
            vec![
                ProviderOutcome::Ok(CompanyData::default()),
                ProviderOutcome::Ok(CompanyData::default()),
            ],
        );
        let router = router(vec![a, b], &[("a", 60), ("b", 60)]);

        let (name, _) = router.route(&cnpj()).await.expect("route succeeds");
        assert_eq!(name, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_terminal_and_does_not_fall_back() {
        let a = ScriptedProvider::new("a", vec![ProviderOutcome::NotFound]);
        let router = router(vec![a], &[("a", 60)]);

        assert_eq!(router.route(&cnpj()).await, Err(RouteError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn all_transient_failures_surface_last_cause() {
        let a = ScriptedProvider::new(
            "a",
            vec![ProviderOutcome::TransientError("timeout".into())],
        );
        let b = ScriptedProvider::new(
            "b",
            vec![ProviderOutcome::TransientError("boom".into())],
        );
        let router = router(vec![a, b], &[("a", 60), ("b", 60)]);

        match router.route(&cnpj()).await {
            Err(RouteError::AllProvidersFailed(cause)) => {
                assert!(cause.contains("timeout") || cause.contains("boom"));
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooled_down_provider_yields_no_provider_available() {
        let a = ScriptedProvider::new("a", vec![ProviderOutcome::RateLimited]);
        let router = router(vec![a], &[("a", 60)]);

        // First call burns the only provider into a 60s cooldown and fails.
        let first = router.route(&cnpj()).await;
        assert!(matches!(first, Err(RouteError::AllProvidersFailed(_))));

        // Second call cannot get a provider within the 5s budget.
        let second = router.route(&cnpj()).await;
        assert_eq!(second, Err(RouteError::NoProviderAvailable));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_outcome_carries_cause() {
        let a = ScriptedProvider::new(
            "a",
            vec![ProviderOutcome::Invalid("malformed CNPJ".into())],
        );
        let router = router(vec![a], &[("a", 60)]);

        assert_eq!(
            router.route(&cnpj()).await,
            Err(RouteError::Invalid("malformed CNPJ".into()))
        );
    }
}
