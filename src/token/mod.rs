//! Shared token budget for the upstream API.
//!
//! Every response (success or 429) reports the caller's remaining tokens, the
//! refill rate per minute and the time until the next refill. The coordinator
//! keeps the latest values and makes callers wait before sending when the
//! budget drops below the configured threshold:
//! - `observe` folds a response body into the shared state
//! - `should_wait` predicts how long to hold off, clamped to `[1s, max_wait_time]`
//! - `wait_if_needed` polls once a second on its own deadline and returns as
//!   soon as another caller's response shows the budget has recovered

mod coordinator;
mod envelope;
mod state;

pub use coordinator::TokenCoordinator;
pub use envelope::{TokenEnvelope, UpstreamError};
pub use state::{TokenSnapshot, TokenState};
