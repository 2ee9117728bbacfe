//! Token-budget-aware client for the Keepa data API.
//!
//! [`KeepaClient`] waits on a shared [`TokenCoordinator`] before each request,
//! folds the token fields of every response back into it, and retries 429
//! rejections once the budget has had time to refill.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod token;
pub mod types;

pub use client::{Dispatch, KeepaClient};
pub use config::{Config, ConfigError, TokenConfig};
pub use error::{Error, Result};
pub use http::HttpExecutor;
pub use token::{TokenCoordinator, TokenEnvelope, TokenSnapshot};
pub use types::{Method, PendingRequest};
