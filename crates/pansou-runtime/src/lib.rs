//! # PanSou Runtime
//!
//! The orchestration layer: configuration loading, logging setup, JWT
//! auth, and the axum HTTP surface that fronts the
//! [`SearchService`](pansou_kernel::SearchService).
//!
//! ```rust,ignore
//! use pansou_runtime::{config::AppConfig, logging, server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     logging::init_from_config(&config.logging);
//!     let registry = Arc::new(pansou_plugins::builtin_registry()?);
//!     server::serve(registry, config).await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod filter;
pub mod handlers;
pub mod logging;
pub mod server;

pub use config::AppConfig;
pub use server::{build_router, serve, AppState};
