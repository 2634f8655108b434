use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::token_bucket::TokenBucket;

/// Tuning knobs for the limiter, usually taken from [`crate::Config`].
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Base cooldown applied after a provider signals overload.
    pub cooldown_base: Duration,
    /// Cap for the exponential cooldown.
    pub cooldown_max: Duration,
    /// Initial safety factor for providers at or below `safety_threshold`.
    pub safety_factor_low: f64,
    /// Initial safety factor for providers above `safety_threshold`.
    pub safety_factor_high: f64,
    /// Per-minute limit at or below which the low initial factor applies.
    pub safety_threshold: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            cooldown_base: Duration::from_secs(60),
            cooldown_max: Duration::from_secs(300),
            safety_factor_low: 0.7,
            safety_factor_high: 0.8,
            safety_threshold: 3,
        }
    }
}

/// Point-in-time view of one provider's limiter state.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    /// Provider name as registered.
    pub name: String,
    /// Tokens currently in the bucket.
    pub tokens: f64,
    /// Effective capacity after the safety factor.
    pub effective_capacity: f64,
    /// Current safety factor.
    pub safety_factor: f64,
    /// Remaining cooldown, zero when the provider is selectable.
    pub cooldown_remaining: Duration,
    /// Consecutive failures since the last success.
    pub consecutive_errors: u32,
    /// Consecutive successes since the last failure.
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct ProviderState {
    bucket: TokenBucket,
    last_used: Option<Instant>,
    cooldown_until: Option<Instant>,
    consecutive_errors: u32,
    consecutive_successes: u32,
}

impl ProviderState {
    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Adaptive rate accounting over a set of providers with heterogeneous
/// per-minute limits.
///
/// Owns one [`TokenBucket`] per provider and decides which provider should
/// serve the next request: providers are scored by bucket fullness, time
/// since last use and recent error history, with a little jitter to break
/// ties. Feedback from callers moves the per-provider safety factor and puts
/// overloaded providers into an exponentially growing cooldown.
///
/// All state lives behind a single mutex; none of the critical sections
/// await.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    providers: Mutex<HashMap<String, ProviderState>>,
    settings: LimiterSettings,
    total_limit: u32,
}

impl AdaptiveRateLimiter {
    /// Build a limiter over `(name, limit_per_minute)` pairs.
    ///
    /// Providers with a limit at or below `settings.safety_threshold` start
    /// at the low safety factor, everything else at the high one.
    pub fn new(
        limits: impl IntoIterator<Item = (String, u32)>,
        settings: LimiterSettings,
    ) -> Self {
        let mut providers = HashMap::new();
        let mut total_limit = 0;
        for (name, limit) in limits {
            let initial_safety = if limit <= settings.safety_threshold {
                settings.safety_factor_low
            } else {
                settings.safety_factor_high
            };
            debug!(
                provider = %name,
                limit_per_minute = limit,
                safety_factor = initial_safety,
                "Registering provider"
            );
            total_limit += limit;
            providers.insert(
                name,
                ProviderState {
                    bucket: TokenBucket::new(limit, initial_safety),
                    last_used: None,
                    cooldown_until: None,
                    consecutive_errors: 0,
                    consecutive_successes: 0,
                },
            );
        }
        Self {
            providers: Mutex::new(providers),
            settings,
            total_limit,
        }
    }

    /// Sum of the declared per-minute limits of all registered providers.
    pub fn total_limit_per_minute(&self) -> u32 {
        self.total_limit
    }

    /// Select the best provider among `candidates` without consuming a token.
    ///
    /// Returns `None` when every candidate is cooling down or out of tokens.
    pub async fn pick_provider(&self, candidates: &[String]) -> Option<String> {
        let mut providers = self.providers.lock().await;
        Self::pick_locked(&mut providers, candidates)
    }

    /// Mark `provider` as used now and take one token from its bucket.
    pub async fn consume(&self, provider: &str) {
        let mut providers = self.providers.lock().await;
        if let Some(state) = providers.get_mut(provider) {
            Self::consume_locked(state);
        }
    }

    /// Select and consume in one critical section.
    ///
    /// This is what the router uses: two concurrent callers can never spend
    /// the same token.
    pub async fn acquire(&self, candidates: &[String]) -> Option<String> {
        let mut providers = self.providers.lock().await;
        let picked = Self::pick_locked(&mut providers, candidates)?;
        if let Some(state) = providers.get_mut(&picked) {
            Self::consume_locked(state);
        }
        Some(picked)
    }

    /// Record a successful request against `provider`.
    ///
    /// Every ten consecutive successes nudge the safety factor up by 0.05.
    pub async fn on_success(&self, provider: &str) {
        let mut providers = self.providers.lock().await;
        if let Some(state) = providers.get_mut(provider) {
            state.consecutive_errors = 0;
            state.consecutive_successes += 1;
            if state.consecutive_successes % 10 == 0 {
                state.bucket.adjust_safety(0.05);
                debug!(
                    provider,
                    safety_factor = state.bucket.safety_factor(),
                    "Raised safety factor after sustained success"
                );
            }
        }
    }

    /// Record an explicit overload signal (429-equivalent) from `provider`.
    ///
    /// Lowers the safety factor by 0.1 and places the provider in an
    /// exponential cooldown: `base * 2^(errors - 1)`, capped.
    pub async fn on_rate_limited(&self, provider: &str) {
        let mut providers = self.providers.lock().await;
        if let Some(state) = providers.get_mut(provider) {
            state.bucket.adjust_safety(-0.1);
            let cooldown = self.begin_cooldown(state);
            warn!(
                provider,
                cooldown_secs = cooldown.as_secs(),
                safety_factor = state.bucket.safety_factor(),
                "Provider rate limited, cooling down"
            );
        }
    }

    /// Record a transient failure (timeout, 5xx, parse error) from `provider`.
    ///
    /// Same cooldown as [`Self::on_rate_limited`] but the safety factor is
    /// left alone: the provider did not tell us our rate was the problem.
    pub async fn on_transient_error(&self, provider: &str) {
        let mut providers = self.providers.lock().await;
        if let Some(state) = providers.get_mut(provider) {
            let cooldown = self.begin_cooldown(state);
            debug!(
                provider,
                cooldown_secs = cooldown.as_secs(),
                "Provider failed transiently, cooling down"
            );
        }
    }

    /// Wait until some candidate becomes available, consuming its token.
    ///
    /// Wakes whenever the nearest bucket refill or cooldown expiry is due.
    /// Returns `None` once `timeout` elapses with nothing available.
    pub async fn wait_for_any(&self, timeout: Duration, candidates: &[String]) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(provider) = self.acquire(candidates).await {
                return Some(provider);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let next_ready = {
                let mut providers = self.providers.lock().await;
                Self::shortest_wait_locked(&mut providers, candidates, now)
            };
            // Pad a little so the wake-up lands after the token exists.
            let wait = next_ready
                .unwrap_or(Duration::from_secs(1))
                .saturating_add(Duration::from_millis(50))
                .min(deadline.duration_since(now));
            sleep(wait).await;
        }
    }

    /// Current limiter state for every provider, for logs and admin views.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let now = Instant::now();
        let mut providers = self.providers.lock().await;
        let mut statuses: Vec<ProviderStatus> = providers
            .iter_mut()
            .map(|(name, state)| {
                state.bucket.refill();
                ProviderStatus {
                    name: name.clone(),
                    tokens: state.bucket.tokens(),
                    effective_capacity: state.bucket.effective_capacity(),
                    safety_factor: state.bucket.safety_factor(),
                    cooldown_remaining: state
                        .cooldown_until
                        .map(|until| until.saturating_duration_since(now))
                        .unwrap_or(Duration::ZERO),
                    consecutive_errors: state.consecutive_errors,
                    consecutive_successes: state.consecutive_successes,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn begin_cooldown(&self, state: &mut ProviderState) -> Duration {
        state.consecutive_errors += 1;
        state.consecutive_successes = 0;
        let exponent = state.consecutive_errors.saturating_sub(1).min(16);
        let cooldown = self
            .settings
            .cooldown_base
            .saturating_mul(1 << exponent)
            .min(self.settings.cooldown_max);
        state.cooldown_until = Some(Instant::now() + cooldown);
        cooldown
    }

    fn pick_locked(
        providers: &mut HashMap<String, ProviderState>,
        candidates: &[String],
    ) -> Option<String> {
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let mut best: Option<(String, f64)> = None;

        for name in candidates {
            let Some(state) = providers.get_mut(name) else {
                continue;
            };
            if state.in_cooldown(now) {
                continue;
            }
            state.bucket.refill();
            if state.bucket.tokens() < 1.0 {
                continue;
            }

            let token_score = state.bucket.tokens() / state.bucket.effective_capacity();
            let time_score = state
                .last_used
                .map(|used| (now.duration_since(used).as_secs_f64() / 60.0).min(1.0))
                .unwrap_or(1.0);
            let error_factor = 1.0 / (1.0 + f64::from(state.consecutive_errors));
            let jitter = rng.gen_range(0.0..0.05);
            let score = 0.40 * token_score + 0.40 * time_score + 0.15 * error_factor + jitter;

            if best.as_ref().map_or(true, |(_, top)| score > *top) {
                best = Some((name.clone(), score));
            }
        }

        best.map(|(name, _)| name)
    }

    fn consume_locked(state: &mut ProviderState) {
        state.bucket.try_take();
        state.last_used = Some(Instant::now());
    }

    fn shortest_wait_locked(
        providers: &mut HashMap<String, ProviderState>,
        candidates: &[String],
        now: Instant,
    ) -> Option<Duration> {
        candidates
            .iter()
            .filter_map(|name| {
                let state = providers.get_mut(name)?;
                if let Some(until) = state.cooldown_until {
                    if now < until {
                        return Some(until.duration_since(now));
                    }
                }
                Some(state.bucket.time_until_available())
            })
            .min()
    }
}
