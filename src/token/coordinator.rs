use chrono::Utc;
use log::{debug, info, warn};
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::envelope::TokenEnvelope;
use super::state::{TokenSnapshot, TokenState};
use crate::config::TokenConfig;
use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SHORT_REMAINDER: Duration = Duration::from_secs(2);

/// Coordinates the upstream token budget between every caller sharing one client.
///
/// Share it by reference (`Arc<TokenCoordinator>`); all state sits behind a
/// single reader/writer lock.
#[derive(Debug)]
pub struct TokenCoordinator {
    state: RwLock<TokenState>,
    poll_interval: Duration,
    #[cfg(test)]
    wait_calls: AtomicU64,
}

impl TokenCoordinator {
    pub fn new(cfg: &TokenConfig) -> Self {
        Self {
            state: RwLock::new(TokenState::new(cfg)),
            poll_interval: POLL_INTERVAL,
            #[cfg(test)]
            wait_calls: AtomicU64::new(0),
        }
    }

    // A panic while holding the lock cannot leave a half-applied update
    // (apply() does not panic), so a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, TokenState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TokenState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Reconcile local state with the token fields of a response body.
    ///
    /// A body that is not a JSON object leaves the state untouched and is
    /// reported as [`crate::Error::ResponseParse`].
    pub fn observe(&self, body: &[u8]) -> Result<TokenEnvelope> {
        let envelope = TokenEnvelope::parse(body)?;
        let mut state = self.write();
        state.apply(&envelope, Utc::now());
        debug!(
            "token info updated: tokens_left={} refill_rate={} refill_in={:?}",
            state.tokens_left, state.refill_rate, state.refill_in
        );
        Ok(envelope)
    }

    pub fn should_wait(&self) -> (bool, Duration) {
        self.read().should_wait()
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        self.read().snapshot()
    }

    /// Block until the budget looks sufficient or the predicted wait runs out.
    ///
    /// The episode runs on its own deadline. `caller` is only watched so its
    /// cancellation can be logged: the budget is shared by every caller, and
    /// giving up early would not bring any tokens back. Returning with the
    /// budget still short is not an error; the next request simply risks
    /// another 429.
    pub async fn wait_if_needed(&self, caller: &CancellationToken) {
        #[cfg(test)]
        self.wait_calls.fetch_add(1, Ordering::Relaxed);
        let (must_wait, wait) = self.should_wait();
        if !must_wait {
            return;
        }

        let snapshot = self.snapshot();
        info!(
            "waiting for token refill: tokens_left={} min_threshold={} wait_time={:?}",
            snapshot.tokens_left, snapshot.min_tokens_threshold, wait
        );

        let deadline = Instant::now() + wait;
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut caller_cancelled = caller.is_cancelled();
        if caller_cancelled {
            warn!("caller already cancelled, still waiting for token refill");
        }

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    if self.should_wait().0 {
                        warn!(
                            "token wait timeout reached, but tokens may still be insufficient: tokens_left={}",
                            self.snapshot().tokens_left
                        );
                    } else {
                        info!("token refilled after wait timeout");
                    }
                    return;
                }
                _ = caller.cancelled(), if !caller_cancelled => {
                    caller_cancelled = true;
                    warn!("caller cancelled while waiting, continuing to wait for token refill");
                }
                _ = ticker.tick() => {
                    let (still_waiting, remaining) = self.should_wait();
                    if !still_waiting {
                        info!("token refilled, resuming requests");
                        return;
                    }
                    if remaining < SHORT_REMAINDER {
                        sleep(remaining.min(deadline.saturating_duration_since(Instant::now()))).await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
impl TokenCoordinator {
    pub(crate) fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How many times `wait_if_needed` has been entered.
    pub(crate) fn wait_calls(&self) -> u64 {
        self.wait_calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn coordinator() -> TokenCoordinator {
        TokenCoordinator::new(&TokenConfig::default())
    }

    #[test]
    fn observe_overwrites_only_present_fields() {
        let c = coordinator();
        c.observe(br#"{"tokensLeft": 40, "refillRate": 20, "refillIn": 3000}"#)
            .unwrap();
        let before = c.snapshot();
        c.observe(br#"{"tokensLeft": 12}"#).unwrap();
        let after = c.snapshot();
        assert_eq!(after.tokens_left, 12);
        assert_eq!(after.refill_rate, 20);
        assert_eq!(after.refill_in, Duration::from_millis(3000));
        assert!(after.last_update > before.last_update);
        assert_eq!(after.generation, 2);
    }

    #[test]
    fn malformed_body_leaves_state_untouched() {
        let c = coordinator();
        c.observe(br#"{"tokensLeft": 3, "refillRate": 20, "refillIn": 900}"#)
            .unwrap();
        let before = c.snapshot();
        assert!(c.observe(b"upstream exploded").is_err());
        assert!(c.observe(b"[]").is_err());
        assert_eq!(c.snapshot(), before);
    }

    #[test]
    fn rejection_with_odd_error_field_still_lowers_budget() {
        let c = coordinator();
        c.observe(br#"{"tokensLeft": 100, "refillRate": 20, "refillIn": 1000}"#)
            .unwrap();
        c.observe(br#"{"tokensLeft": -50, "refillIn": 3000, "refillRate": 20, "error": {"type": "tokenLimit", "message": null}}"#)
            .unwrap();
        assert_eq!(c.snapshot().tokens_left, -50);
        assert_eq!(c.should_wait(), (true, Duration::from_secs(3)));

        c.observe(br#"{"tokensLeft": -60, "refillIn": 4000, "refillRate": 20, "error": "NOT_ENOUGH_TOKEN"}"#)
            .unwrap();
        assert_eq!(c.snapshot().tokens_left, -60);
        assert_eq!(c.should_wait(), (true, Duration::from_secs(4)));
    }

    #[test]
    fn disabled_coordinator_never_waits() {
        let c = TokenCoordinator::new(&TokenConfig {
            rate_limit_enabled: false,
            ..TokenConfig::default()
        });
        c.observe(br#"{"tokensLeft": -1000, "refillRate": 20, "refillIn": 30000}"#)
            .unwrap();
        assert_eq!(c.should_wait(), (false, Duration::ZERO));
        assert!(!c.snapshot().rate_limit_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_when_budget_is_sufficient() {
        let c = coordinator();
        c.observe(br#"{"tokensLeft": 100}"#).unwrap();
        let start = Instant::now();
        c.wait_if_needed(&CancellationToken::new()).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(c.wait_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_does_not_cut_the_wait_short() {
        let c = coordinator();
        c.observe(br#"{"tokensLeft": 0, "refillRate": 20, "refillIn": 5000}"#)
            .unwrap();
        let caller = CancellationToken::new();
        caller.cancel();

        let start = Instant::now();
        c.wait_if_needed(&caller).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_wait_is_ignored() {
        let c = coordinator();
        c.observe(br#"{"tokensLeft": 0, "refillRate": 20, "refillIn": 5000}"#)
            .unwrap();
        let caller = CancellationToken::new();
        let trigger = caller.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        c.wait_if_needed(&caller).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_observe_ends_the_wait_early() {
        let c = Arc::new(coordinator());
        c.observe(br#"{"tokensLeft": -20, "refillRate": 20, "refillIn": 30000}"#)
            .unwrap();
        let other = Arc::clone(&c);
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            other.observe(br#"{"tokensLeft": 80}"#).unwrap();
        });

        let start = Instant::now();
        c.wait_if_needed(&CancellationToken::new()).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(4), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_never_exceeds_max_wait_time() {
        let c = TokenCoordinator::new(&TokenConfig {
            max_wait_time: Duration::from_secs(10),
            ..TokenConfig::default()
        })
        .with_poll_interval(Duration::from_millis(250));
        c.observe(br#"{"tokensLeft": -500, "refillRate": 1, "refillIn": 0}"#)
            .unwrap();
        assert_eq!(c.should_wait(), (true, Duration::from_secs(10)));

        let start = Instant::now();
        c.wait_if_needed(&CancellationToken::new()).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[test]
    fn concurrent_updates_are_never_torn() {
        let c = Arc::new(coordinator());
        let writers: Vec<_> = (1..=8)
            .map(|w| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..500i64 {
                        let n = w * 1_000 + i;
                        let body = format!(
                            r#"{{"tokensLeft": {}, "refillRate": {}, "refillIn": {}}}"#,
                            n,
                            n * 10,
                            n * 100
                        );
                        c.observe(body.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let s = c.snapshot();
                        if s.generation == 0 {
                            continue;
                        }
                        assert_eq!(s.refill_rate, s.tokens_left * 10);
                        assert_eq!(s.refill_in, Duration::from_millis(s.tokens_left as u64 * 100));
                        let _ = c.should_wait();
                    }
                })
            })
            .collect();
        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }
        assert_eq!(c.snapshot().generation, 8 * 500);
    }
}
