use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.keepa.com/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_TOKENS_THRESHOLD: i64 = 5;
pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the shared token budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    pub min_tokens_threshold: i64,
    pub max_wait_time: Duration,
    pub rate_limit_enabled: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            min_tokens_threshold: DEFAULT_MIN_TOKENS_THRESHOLD,
            max_wait_time: DEFAULT_MAX_WAIT_TIME,
            rate_limit_enabled: true,
        }
    }
}

impl TokenConfig {
    /// Replace unusable values: a non-positive threshold or a zero wait ceiling
    /// fall back to the defaults, and the ceiling is never below one second.
    pub fn normalized(mut self) -> Self {
        if self.min_tokens_threshold <= 0 {
            self.min_tokens_threshold = DEFAULT_MIN_TOKENS_THRESHOLD;
        }
        if self.max_wait_time.is_zero() {
            self.max_wait_time = DEFAULT_MAX_WAIT_TIME;
        }
        if self.max_wait_time < Duration::from_secs(1) {
            self.max_wait_time = Duration::from_secs(1);
        }
        self
    }
}

/// Runtime configuration for the Keepa API client.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub access_key: String,
    pub api_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub print_curl_command: bool,
    pub print_response_body: bool,
    pub max_rate_limit_retries: Option<u32>,
    pub tokens: TokenConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: default_user_agent(),
            timeout: DEFAULT_TIMEOUT,
            print_curl_command: false,
            print_response_body: false,
            max_rate_limit_retries: None,
            tokens: TokenConfig::default(),
        }
    }
}

fn default_user_agent() -> String {
    format!("keepa-client/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - KEEPA_ACCESS_KEY (no default; requests fail without it)
    /// - KEEPA_API_URL (default: https://api.keepa.com/)
    /// - KEEPA_HTTP_TIMEOUT (default: 30s)
    /// - KEEPA_USER_AGENT (default: keepa-client/<version>)
    /// - KEEPA_PRINT_CURL_COMMAND, KEEPA_PRINT_RESPONSE_BODY (default: false)
    /// - KEEPA_MIN_TOKENS_THRESHOLD (default: 5)
    /// - KEEPA_MAX_WAIT_TIME (default: 60m)
    /// - KEEPA_ENABLE_RATE_LIMIT (default: true)
    /// - KEEPA_MAX_RATE_LIMIT_RETRIES (default: unbounded)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Config::default();

        let access_key = get("KEEPA_ACCESS_KEY").unwrap_or_default();
        let api_url = get("KEEPA_API_URL").unwrap_or(defaults.api_url);
        let user_agent = get("KEEPA_USER_AGENT").unwrap_or(defaults.user_agent);

        let timeout = match get("KEEPA_HTTP_TIMEOUT") {
            Some(v) => parse_duration_var("KEEPA_HTTP_TIMEOUT", &v)?,
            None => defaults.timeout,
        };
        let print_curl_command = match get("KEEPA_PRINT_CURL_COMMAND") {
            Some(v) => parse_bool_var("KEEPA_PRINT_CURL_COMMAND", &v)?,
            None => false,
        };
        let print_response_body = match get("KEEPA_PRINT_RESPONSE_BODY") {
            Some(v) => parse_bool_var("KEEPA_PRINT_RESPONSE_BODY", &v)?,
            None => false,
        };
        let max_rate_limit_retries = match get("KEEPA_MAX_RATE_LIMIT_RETRIES") {
            Some(v) => Some(v.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
                var: "KEEPA_MAX_RATE_LIMIT_RETRIES",
                value: v.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let mut tokens = TokenConfig::default();
        if let Some(v) = get("KEEPA_MIN_TOKENS_THRESHOLD") {
            tokens.min_tokens_threshold =
                v.trim().parse::<i64>().map_err(|e| ConfigError::Invalid {
                    var: "KEEPA_MIN_TOKENS_THRESHOLD",
                    value: v.clone(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(v) = get("KEEPA_MAX_WAIT_TIME") {
            tokens.max_wait_time = parse_duration_var("KEEPA_MAX_WAIT_TIME", &v)?;
        }
        if let Some(v) = get("KEEPA_ENABLE_RATE_LIMIT") {
            tokens.rate_limit_enabled = parse_bool_var("KEEPA_ENABLE_RATE_LIMIT", &v)?;
        }

        Ok(Self {
            access_key,
            api_url,
            user_agent,
            timeout: if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout },
            print_curl_command,
            print_response_body,
            max_rate_limit_retries,
            tokens: tokens.normalized(),
        })
    }
}

fn parse_duration_var(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|reason| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    })
}

fn parse_bool_var(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

/// Parse `500ms`, `30s`, `60m`, `1h30m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in {:?}", s))?;
        if digits == 0 {
            return Err(format!("expected a number in {:?}", s));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("{}: {}", s, e))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            unit => return Err(format!("unknown unit {:?}", unit)),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}
