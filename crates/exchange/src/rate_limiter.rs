use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};
use tradegate_core::{Result, TradeGateError};

/// Header name prefixes the exchange uses to report budget usage. A header
/// with one of these prefixes that matches no configured budget means the
/// local model is stale.
pub const USAGE_HEADER_PREFIXES: [&str; 2] = ["x-mbx-used-weight-", "x-mbx-order-count-"];

/// One server-side request budget: `limit` units per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub limit: u32,
    pub window: Duration,
}

impl RateBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Pause owed after a response that reported `used` units of `budget`.
///
/// The base spacing is `window / limit`. It is halved while more than half
/// of the budget remains and scaled by 1.5 otherwise, then reduced by the
/// time the request itself took. Never negative.
pub fn required_wait(used: u64, budget: &RateBudget, elapsed: Duration) -> Duration {
    if budget.limit == 0 {
        return Duration::ZERO;
    }

    let limit = budget.limit as f64;
    let remaining = limit - used as f64;
    let base = budget.window.as_secs_f64() / limit;
    let factor = if remaining > limit / 2.0 { 0.5 } else { 1.5 };
    let wait = base * factor - elapsed.as_secs_f64();

    if wait > 0.0 {
        Duration::from_secs_f64(wait)
    } else {
        Duration::ZERO
    }
}

/// Spaces REST calls according to the usage headers the exchange returns.
#[derive(Debug, Default)]
pub struct AdaptiveRateLimiter {
    // Keyed by lowercase header name.
    budgets: RwLock<HashMap<String, RateBudget>>,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all budgets.
    pub fn configure<I>(&self, budgets: I)
    where
        I: IntoIterator<Item = (String, RateBudget)>,
    {
        let budgets: HashMap<String, RateBudget> = budgets
            .into_iter()
            .map(|(header, budget)| (header.to_lowercase(), budget))
            .collect();
        debug!(count = budgets.len(), "Rate budgets configured");
        *self.budgets.write() = budgets;
    }

    pub fn set_budget(&self, header: &str, budget: RateBudget) {
        self.budgets.write().insert(header.to_lowercase(), budget);
    }

    pub fn budgets(&self) -> HashMap<String, RateBudget> {
        self.budgets.read().clone()
    }

    /// Maximum wait across every budget whose header is present.
    pub fn assess(&self, headers: &HeaderMap, elapsed: Duration) -> Result<Duration> {
        let budgets = self.budgets.read();
        if budgets.is_empty() {
            return Ok(Duration::ZERO);
        }

        let mut longest: Option<Duration> = None;
        for (header, budget) in budgets.iter() {
            let Some(value) = headers.get(header.as_str()) else {
                continue;
            };

            let used = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    TradeGateError::RateLimitIntegrity(format!(
                        "unparseable usage header {}: {:?}",
                        header, value
                    ))
                })?;

            let wait = required_wait(used, budget, elapsed);
            debug!(
                header = %header,
                limit = budget.limit,
                used,
                wait_ms = wait.as_millis() as u64,
                "Rate budget usage"
            );
            longest = Some(longest.map_or(wait, |current| current.max(wait)));
        }

        if let Some(wait) = longest {
            return Ok(wait);
        }

        for name in headers.keys() {
            let name = name.as_str();
            if USAGE_HEADER_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                error!(header = %name, "Unrecognized rate limit header");
                return Err(TradeGateError::RateLimitIntegrity(format!(
                    "unrecognized rate limit header: {}",
                    name
                )));
            }
        }

        Ok(Duration::ZERO)
    }

    /// Sleeps for the wait computed by [`assess`](Self::assess).
    pub async fn throttle(&self, headers: &HeaderMap, elapsed: Duration) -> Result<()> {
        let wait = self.assess(headers, elapsed)?;
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter pausing");
            sleep(wait).await;
        }
        Ok(())
    }
}
