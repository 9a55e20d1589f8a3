//! # PanSou Transport
//!
//! HTTP plumbing shared by every adapter: tuned, pooled client
//! construction, the retry policy, and the challenge client used against
//! anti-bot-fronted upstreams.
//!
//! Two rules every adapter follows:
//!
//! 1. **One client per plugin, built once.** Pool construction per request
//!    is forbidden; a plugin builds its client at construction time via
//!    [`HttpClientConfig`] and reuses it for its whole life.
//! 2. **Retries clone the request.** A request body or cookie state must
//!    never be reused across attempts; [`RetryPolicy::send`] clones the
//!    builder for every try.

pub mod client;
pub mod error;
pub mod retry;
pub mod scrape;

pub use client::{HttpClientConfig, DEFAULT_USER_AGENT};
pub use error::{TransportError, TransportResult};
pub use retry::RetryPolicy;
pub use scrape::ChallengeClient;
