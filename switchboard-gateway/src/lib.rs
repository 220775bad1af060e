//! # Switchboard Gateway
//!
//! The HTTP server binary around `switchboard-core`'s request-execution
//! core: loads a [`config::Config`], builds the registry/health/quota/
//! router/orchestrator stack, and exposes `/v1/chat/completions`,
//! `/v1/models`, and `/health` over axum.
//!
//! Authentication, CORS, rate limiting, admin UI, and caching are
//! deliberately absent — those are assumed to sit in an edge layer in
//! front of this service.
//!
//! ## Quick start
//!
//! ```rust
//! use switchboard_gateway::{config::Config, server::create_server};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::default();
//! let app = create_server(config).await?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod request_context;
pub mod server;

pub use server::create_server;
