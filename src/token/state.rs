use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use super::envelope::TokenEnvelope;
use crate::config::TokenConfig;

/// Local view of the upstream token budget.
///
/// The four server-derived fields (`tokens_left`, `refill_rate`, `refill_in`,
/// `last_update`) are only written together by [`TokenState::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub(crate) tokens_left: i64,
    pub(crate) refill_rate: i64,
    pub(crate) refill_in: Duration,
    /// `None` until the first response has been observed.
    pub(crate) last_update: Option<DateTime<Utc>>,
    pub(crate) generation: u64,
    pub(crate) min_tokens_threshold: i64,
    pub(crate) max_wait_time: Duration,
    pub(crate) rate_limit_enabled: bool,
}

/// Point-in-time copy of [`TokenState`], taken under one read lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub tokens_left: i64,
    pub refill_rate: i64,
    pub refill_in: Duration,
    pub last_update: Option<DateTime<Utc>>,
    /// Number of responses applied so far.
    pub generation: u64,
    pub min_tokens_threshold: i64,
    pub max_wait_time: Duration,
    pub rate_limit_enabled: bool,
}

impl TokenState {
    pub fn new(cfg: &TokenConfig) -> Self {
        let cfg = cfg.clone().normalized();
        Self {
            tokens_left: 0,
            refill_rate: 0,
            refill_in: Duration::ZERO,
            last_update: None,
            generation: 0,
            min_tokens_threshold: cfg.min_tokens_threshold,
            max_wait_time: cfg.max_wait_time,
            rate_limit_enabled: cfg.rate_limit_enabled,
        }
    }

    /// Whether a caller must hold off, and for how long.
    ///
    /// The returned duration is always within `[1s, max_wait_time]` when the
    /// flag is true, and zero otherwise. An unknown budget never waits.
    pub fn should_wait(&self) -> (bool, Duration) {
        if !self.rate_limit_enabled || self.tokens_left >= self.min_tokens_threshold {
            return (false, Duration::ZERO);
        }
        // Nothing observed yet. The zero balance is a placeholder rather than a
        // reading, so the first request goes out at once instead of paying the
        // 1s minimum wait; a 429 on it still updates the budget and waits.
        if self.last_update.is_none() {
            return (false, Duration::ZERO);
        }

        let mut wait = self.refill_in;
        // The server has just ticked but the budget is still short: estimate
        // from the refill rate instead.
        if wait < Duration::from_secs(1) && self.refill_rate > 0 {
            let needed = self.min_tokens_threshold.saturating_sub(self.tokens_left);
            let minutes = (needed as u64).div_ceil(self.refill_rate as u64);
            wait = Duration::from_secs(minutes.saturating_mul(60));
        }

        (true, wait.clamp(Duration::from_secs(1), self.max_wait_time))
    }

    /// Fold one decoded response into the state. Absent fields are kept.
    pub(crate) fn apply(&mut self, envelope: &TokenEnvelope, now: DateTime<Utc>) {
        if let Some(rate) = envelope.refill_rate {
            self.refill_rate = rate;
        }
        if let Some(ms) = envelope.refill_in {
            self.refill_in = Duration::from_millis(ms.max(0) as u64);
        }
        if let Some(left) = envelope.tokens_left {
            self.tokens_left = left;
        }
        // Keep freshness strictly increasing even if the clock stalls or steps back.
        self.last_update = Some(match self.last_update {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        });
        self.generation += 1;
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            tokens_left: self.tokens_left,
            refill_rate: self.refill_rate,
            refill_in: self.refill_in,
            last_update: self.last_update,
            generation: self.generation,
            min_tokens_threshold: self.min_tokens_threshold,
            max_wait_time: self.max_wait_time,
            rate_limit_enabled: self.rate_limit_enabled,
        }
    }
}
