// ABOUTME: Security gate run before any request reaches the execution scheduler
// ABOUTME: Combines deny-list code checks, per-client rate limiting and parameter sanitization

mod patterns;
mod sanitize;

pub use patterns::{find_violation, PatternClass};
pub use sanitize::{sanitize_str, sanitize_value};

use crate::error::{Result, SandboxError};
use crate::settings::SandboxSettings;
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SecurityGate {
    /// Per-client point budget, keyed by client id
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
    max_code_bytes: usize,
}

impl SecurityGate {
    pub fn new(settings: &SandboxSettings) -> Self {
        let points = NonZeroU32::new(settings.rate_limit.points).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(settings.rate_limit.window_secs.max(1));

        Self {
            limiter: RateLimiter::keyed(client_quota(points, window)),
            clock: DefaultClock::default(),
            max_code_bytes: settings.scheduler.max_code_bytes,
        }
    }

    /// Spend one point from the client's budget
    pub fn check_rate_limit(&self, client_id: &str) -> Result<()> {
        match self.limiter.check_key(&client_id.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(self.clock.now());
                warn!(
                    client_id = %client_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Client exceeded rate limit"
                );
                Err(SandboxError::RateLimited {
                    client_id: client_id.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                })
            }
        }
    }

    /// Reject empty, oversized or deny-listed code. `language` is the canonical language name.
    pub fn validate_code(&self, language: &str, code: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Err(SandboxError::Validation("code must not be empty".to_string()));
        }
        if code.len() > self.max_code_bytes {
            return Err(SandboxError::Validation(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.max_code_bytes
            )));
        }

        if let Some(class) = find_violation(language, code) {
            warn!(language = %language, class = %class, "Rejected code matching deny-list");
            return Err(SandboxError::Blocked {
                class: class.as_str(),
            });
        }

        Ok(())
    }

    pub fn sanitize_params(&self, params: serde_json::Value) -> serde_json::Value {
        sanitize_value(params)
    }

    /// Forget clients whose budget has fully refilled
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!("Rate limiter tracks {} clients", self.limiter.len());
    }
}

/// `points` per `window`, all of which may be spent in a burst
fn client_quota(points: NonZeroU32, window: Duration) -> Quota {
    let period = window / points.get();
    Quota::with_period(period.max(Duration::from_nanos(1)))
        .unwrap_or_else(|| Quota::per_second(points))
        .allow_burst(points)
}
