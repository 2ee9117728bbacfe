use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{Method, PendingRequest};
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Request, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod diagnostics;

pub use diagnostics::{curl_command, format_response_body, redact_access_key};

/// Query parameter carrying the access credential.
pub const ACCESS_KEY_PARAM: &str = "key";

pub fn build_client(cfg: &Config) -> Result<Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, HeaderValue::from_str(&cfg.user_agent)?);
    let builder = Client::builder()
        .default_headers(default_headers)
        .timeout(cfg.timeout)
        .use_rustls_tls();
    Ok(builder.build()?)
}

/// Join `endpoint` onto the path of `base`, dropping empty segments.
pub fn join_endpoint(base: &Url, endpoint: &str) -> Result<Url> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidBaseUrl(base.to_string()))?;
        segments.pop_if_empty();
        for seg in endpoint.split('/').filter(|s| !s.is_empty()) {
            segments.push(seg);
        }
    }
    Ok(url)
}

/// Build the final request URL: base + endpoint, the access key, then the
/// caller's parameters. Later keys overwrite earlier ones.
pub fn request_url(
    base: &Url,
    access_key: &str,
    endpoint: &str,
    params: &BTreeMap<String, String>,
) -> Result<Url> {
    if access_key.is_empty() {
        return Err(Error::MissingCredential);
    }
    let mut url = join_endpoint(base, endpoint)?;
    let mut query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    query.insert(ACCESS_KEY_PARAM.to_string(), access_key.to_string());
    for (k, v) in params {
        query.insert(k.clone(), v.clone());
    }
    url.query_pairs_mut().clear().extend_pairs(query.iter());
    Ok(url)
}

/// Performs exactly one HTTP round trip per call.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    base_url: Url,
    access_key: String,
    timeout: Duration,
    print_curl_command: bool,
    print_response_body: bool,
}

impl HttpExecutor {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            client: build_client(cfg)?,
            base_url: Url::parse(&cfg.api_url)?,
            access_key: cfg.access_key.clone(),
            timeout: cfg.timeout,
            print_curl_command: cfg.print_curl_command,
            print_response_body: cfg.print_response_body,
        })
    }

    fn build_request(&self, req: &PendingRequest) -> Result<Request> {
        let url = match request_url(&self.base_url, &self.access_key, &req.endpoint, &req.params) {
            Ok(url) => url,
            Err(e) => {
                error!("failed to build request for {}: {}", req.endpoint, e);
                return Err(e);
            }
        };
        let mut builder = self
            .client
            .request(req.method.as_reqwest(), url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if req.method == Method::Post {
            let body = match &req.body {
                Some(v) => serde_json::to_vec(v).map_err(Error::Encode)?,
                None => Vec::new(),
            };
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body);
        }
        Ok(builder.build()?)
    }

    fn curl_for(&self, request: &Request) -> String {
        let body = request.body().and_then(|b| b.as_bytes());
        curl_command(request.method().as_str(), request.url().as_str(), request.headers(), body)
    }

    /// Send one request and classify the outcome.
    ///
    /// 2xx returns the body as-is, 429 returns [`Error::RateLimited`] carrying
    /// the rejection body, any other status is [`Error::Status`].
    ///
    /// A caller that is already cancelled does not stop the request: it is
    /// sent anyway, bounded only by the client timeout, so the response can
    /// still update the shared token budget. A cancellation that arrives while
    /// the request is in flight is honored.
    pub async fn send(&self, req: &PendingRequest, caller: &CancellationToken) -> Result<Vec<u8>> {
        let request = self.build_request(req)?;
        let url = redact_access_key(request.url());
        let curl = self.print_curl_command.then(|| self.curl_for(&request));
        if let Some(cmd) = &curl {
            info!("sending {} request to {}: {}", request.method(), url, cmd);
        } else {
            debug!("sending {} request to {} params={:?}", request.method(), req.endpoint, req.params);
        }

        let response = if caller.is_cancelled() {
            warn!(
                "caller cancelled before dispatch, sending {} with a fresh {:?} timeout",
                req.endpoint, self.timeout
            );
            self.client.execute(request).await
        } else {
            tokio::select! {
                res = self.client.execute(request) => res,
                _ = caller.cancelled() => {
                    warn!("request to {} cancelled by caller", req.endpoint);
                    return Err(Error::Cancelled);
                }
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                match &curl {
                    Some(cmd) => error!("HTTP request to {} failed: {} ({})", url, e, cmd),
                    None => error!("HTTP request to {} failed: {}", url, e),
                }
                return Err(Error::Transport(e));
            }
        };

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            error!("failed to read response body from {}: {}", req.endpoint, e);
            Error::Transport(e)
        })?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            debug!("rate limited by upstream: {}", url);
            return Err(Error::RateLimited {
                body: body.to_vec(),
            });
        }
        if !status.is_success() {
            match &curl {
                Some(cmd) => error!("HTTP response error {} from {} ({})", status, url, cmd),
                None => error!("HTTP response error {} from {}", status, url),
            }
            return Err(Error::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        debug!("HTTP request succeeded: status={} url={}", status, url);
        if self.print_response_body {
            info!(
                "response received from {} (status {}, {} bytes):\n{}",
                req.endpoint,
                status,
                body.len(),
                format_response_body(&body, diagnostics::DEFAULT_BODY_LOG_LIMIT)
            );
        }
        Ok(body.to_vec())
    }
}
