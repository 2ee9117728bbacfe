use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::HttpExecutor;
use crate::token::TokenCoordinator;
use crate::types::PendingRequest;

/// One HTTP round trip. `HttpExecutor` is the real implementation; tests
/// plug in scripted executors.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: &PendingRequest, cancel: &CancellationToken)
        -> Result<Vec<u8>>;
}

#[async_trait]
impl Dispatch for HttpExecutor {
    async fn dispatch(
        &self,
        request: &PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.send(request, cancel).await
    }
}

/// Keepa API client: waits on the shared token budget, sends, and retries on 429.
pub struct KeepaClient<D = HttpExecutor> {
    executor: D,
    tokens: Arc<TokenCoordinator>,
    max_rate_limit_retries: Option<u32>,
}

impl KeepaClient<HttpExecutor> {
    /// Build a client with its own token coordinator.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let tokens = Arc::new(TokenCoordinator::new(&cfg.tokens));
        Self::with_coordinator(cfg, tokens)
    }

    /// Build a client that shares `tokens` with other clients using the same key.
    pub fn with_coordinator(cfg: &Config, tokens: Arc<TokenCoordinator>) -> Result<Self> {
        Ok(KeepaClient::new(HttpExecutor::from_config(cfg)?, tokens)
            .with_retry_ceiling(cfg.max_rate_limit_retries))
    }
}

impl<D: Dispatch> KeepaClient<D> {
    pub fn new(executor: D, tokens: Arc<TokenCoordinator>) -> Self {
        Self {
            executor,
            tokens,
            max_rate_limit_retries: None,
        }
    }

    /// Give up with [`Error::PersistentRejection`] after this many consecutive
    /// 429 retries. `None` retries for as long as the upstream keeps rejecting.
    ///
    /// With rate limiting disabled the waits return at once, so this ceiling
    /// is the only bound on back-to-back retries.
    pub fn with_retry_ceiling(mut self, max_retries: Option<u32>) -> Self {
        self.max_rate_limit_retries = max_retries;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenCoordinator> {
        &self.tokens
    }

    pub fn executor(&self) -> &D {
        &self.executor
    }

    /// GET `endpoint` with query parameters.
    pub async fn get_raw<I, K, V>(
        &self,
        endpoint: &str,
        params: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.fetch(&PendingRequest::get(endpoint, params), cancel).await
    }

    /// POST a JSON body to `endpoint`; only the access key goes in the query.
    pub async fn post_raw<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let body = serde_json::to_value(body).map_err(Error::Encode)?;
        self.fetch(&PendingRequest::post(endpoint, body), cancel).await
    }

    /// POST a JSON body to `endpoint` with extra query parameters.
    pub async fn post_raw_with_params<I, K, V, T>(
        &self,
        endpoint: &str,
        params: I,
        body: &T,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body).map_err(Error::Encode)?;
        self.fetch(&PendingRequest::post_with_params(endpoint, params, body), cancel)
            .await
    }

    /// Send `request`, waiting for tokens first and retrying every 429.
    ///
    /// Only the first dispatch runs under `cancel`. Retries run under a fresh
    /// token, and the token waits never abort on `cancel`.
    pub async fn fetch(&self, request: &PendingRequest, cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.tokens.wait_if_needed(cancel).await;

        let mut dispatch_cancel = cancel.clone();
        let mut rejections: u32 = 0;
        loop {
            match self.executor.dispatch(request, &dispatch_cancel).await {
                Ok(body) => {
                    self.record(&request.endpoint, &body);
                    return Ok(body);
                }
                Err(Error::RateLimited { body }) => {
                    rejections += 1;
                    self.record(&request.endpoint, &body);
                    if let Some(max) = self.max_rate_limit_retries {
                        if rejections > max {
                            warn!(
                                "giving up on {} after {} consecutive 429 responses",
                                request.endpoint, rejections
                            );
                            return Err(Error::PersistentRejection {
                                attempts: rejections,
                            });
                        }
                    }
                    warn!(
                        "received 429 from {} ({} in a row), waiting for token refill",
                        request.endpoint, rejections
                    );
                    dispatch_cancel = CancellationToken::new();
                    self.tokens.wait_if_needed(&dispatch_cancel).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record(&self, endpoint: &str, body: &[u8]) {
        match self.tokens.observe(body) {
            Ok(envelope) => {
                if let Some(err) = &envelope.error {
                    warn!(
                        "upstream reported an error for {}: type={} message={} details={}",
                        endpoint, err.kind, err.message, err.details
                    );
                }
                if envelope.tokens_consumed.is_some() || envelope.processing_time_in_ms.is_some() {
                    debug!(
                        "{}: tokens_consumed={:?} processing_time_ms={:?}",
                        endpoint, envelope.tokens_consumed, envelope.processing_time_in_ms
                    );
                }
            }
            Err(e) => warn!("failed to update token info from response for {}: {}", endpoint, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Replays a fixed list of outcomes and records what it was asked to send.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<Vec<u8>>>>,
        seen_cancelled: Mutex<Vec<bool>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                seen_cancelled: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen_cancelled.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Dispatch for Scripted {
        async fn dispatch(
            &self,
            _request: &PendingRequest,
            cancel: &CancellationToken,
        ) -> Result<Vec<u8>> {
            self.seen_cancelled.lock().unwrap().push(cancel.is_cancelled());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("dispatched more often than scripted")
        }
    }

    fn rejected(body: &str) -> Result<Vec<u8>> {
        Err(Error::RateLimited {
            body: body.as_bytes().to_vec(),
        })
    }

    fn client(outcomes: Vec<Result<Vec<u8>>>) -> KeepaClient<Scripted> {
        KeepaClient::new(
            Scripted::new(outcomes),
            Arc::new(TokenCoordinator::new(&TokenConfig::default())),
        )
    }

    fn request() -> PendingRequest {
        PendingRequest::get("product", [("asin", "B000000000")])
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_rejections_until_success() {
        let c = client(vec![
            rejected(r#"{"tokensLeft": -5, "refillRate": 20, "refillIn": 1500}"#),
            rejected(r#"{"tokensLeft": -10, "refillRate": 20, "refillIn": 1200}"#),
            Ok(br#"{"tokensLeft": 30, "products": []}"#.to_vec()),
        ]);

        let body = c.fetch(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(body, br#"{"tokensLeft": 30, "products": []}"#.to_vec());
        assert_eq!(c.executor().calls(), 3);
        assert_eq!(c.tokens().snapshot().generation, 3);
        assert_eq!(c.tokens().snapshot().tokens_left, 30);
        // One wait before the first dispatch, one after each rejection.
        assert!(c.tokens().wait_calls() >= 2);
        assert_eq!(c.tokens().wait_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let c = client(vec![Err(Error::Status {
            status: StatusCode::BAD_REQUEST,
            body: r#"{"error":{"type":"invalidParameter"}}"#.into(),
        })]);
        let err = c.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(c.executor().calls(), 1);
        // Error bodies are not folded into the budget.
        assert_eq!(c.tokens().snapshot().generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_run_under_a_fresh_cancellation_token() {
        let c = client(vec![
            rejected(r#"{"tokensLeft": 50}"#),
            Ok(b"{}".to_vec()),
        ]);
        let caller = CancellationToken::new();
        caller.cancel();
        c.fetch(&request(), &caller).await.unwrap();
        assert_eq!(*c.executor().seen_cancelled.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_success_body_is_still_returned() {
        let c = client(vec![Ok(b"not json at all".to_vec())]);
        let body = c.fetch(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(body, b"not json at all".to_vec());
        assert_eq!(c.tokens().snapshot().generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_surfaces_persistent_rejection() {
        let c = client(vec![
            rejected(r#"{"tokensLeft": 10}"#),
            rejected(r#"{"tokensLeft": 10}"#),
            rejected(r#"{"tokensLeft": 10}"#),
        ])
        .with_retry_ceiling(Some(2));
        let err = c.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::PersistentRejection { attempts: 3 }));
        assert_eq!(c.executor().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_rate_limiting_still_observes_and_retries() {
        let c = KeepaClient::new(
            Scripted::new(vec![
                rejected(r#"{"tokensLeft": -1, "refillRate": 20, "refillIn": 30000}"#),
                Ok(br#"{"tokensLeft": 4}"#.to_vec()),
            ]),
            Arc::new(TokenCoordinator::new(&TokenConfig {
                rate_limit_enabled: false,
                ..TokenConfig::default()
            })),
        );
        let start = Instant::now();
        c.fetch(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(c.executor().calls(), 2);
        assert_eq!(c.tokens().snapshot().generation, 2);
        assert_eq!(c.tokens().snapshot().tokens_left, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_rate_limiting_is_bounded_by_retry_ceiling() {
        let c = KeepaClient::new(
            Scripted::new(vec![
                rejected(r#"{"tokensLeft": -1}"#),
                rejected(r#"{"tokensLeft": -2}"#),
            ]),
            Arc::new(TokenCoordinator::new(&TokenConfig {
                rate_limit_enabled: false,
                ..TokenConfig::default()
            })),
        )
        .with_retry_ceiling(Some(1));
        let err = c.fetch(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::PersistentRejection { attempts: 2 }));
        assert_eq!(c.tokens().snapshot().tokens_left, -2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_with_odd_error_fields_still_wait() {
        let c = client(vec![
            rejected(r#"{"tokensLeft": -50, "refillIn": 3000, "refillRate": 20, "error": {"type": "tokenLimit", "message": null}}"#),
            rejected(r#"{"tokensLeft": -60, "refillIn": 3000, "refillRate": 20, "error": "NOT_ENOUGH_TOKEN"}"#),
            Ok(br#"{"tokensLeft": 40}"#.to_vec()),
        ]);
        c.tokens().observe(br#"{"tokensLeft": 100}"#).unwrap();
        let start = Instant::now();
        c.fetch(&request(), &CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(6), "{:?}", start.elapsed());
        assert_eq!(c.tokens().snapshot().generation, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_before_dispatch_when_budget_is_low() {
        let c = client(vec![Ok(br#"{"tokensLeft": 100}"#.to_vec())]);
        c.tokens()
            .observe(br#"{"tokensLeft": 1, "refillRate": 20, "refillIn": 4000}"#)
            .unwrap();
        let start = Instant::now();
        c.fetch(&request(), &CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn post_helpers_encode_bodies() {
        let c = client(vec![Ok(b"{}".to_vec()), Ok(b"{}".to_vec())]);
        let body = serde_json::json!({"selection": {"current_SALES_gte": 1}});
        c.post_raw("query", &body, &CancellationToken::new())
            .await
            .unwrap();
        c.post_raw_with_params("query", [("domain", "1")], &body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(c.executor().calls(), 2);
    }
}
