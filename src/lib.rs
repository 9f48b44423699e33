//! # capture-proxy
//!
//! Capture-and-forward reverse proxy for LLM HTTP APIs.
//!
//! A client addresses an upstream vendor by URL prefix
//! (`/{domain}/{path…}`); the proxy checks the domain allow-list, forwards
//! the request with the client's own credentials, and streams the response
//! back byte-for-byte. In parallel, a decoded copy of the response is
//! parsed per vendor dialect (OpenAI chat, Anthropic messages, Google
//! Gemini), normalized into an extended ShareGPT conversation, and
//! batch-persisted to an embedded SQLite store for later export as
//! supervised-fine-tuning data.
//!
//! ## Usage modes
//!
//! **As a standalone binary:** run `capture-proxy` and point API clients at
//! `http://localhost:8080/{vendor-domain}/{vendor-path}`.
//!
//! **As a library:** use [`parsers`] and [`normalize`] for the capture
//! pipeline, or embed the full proxy with [`build_router`].
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use capture_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
//! use capture_proxy::persist::{self, WriterOptions};
//! use capture_proxy::store::Database;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProxyConfig::default();
//! let logger = SharedLogger::new("capture-proxy.log")?;
//! let client = reqwest::Client::new();
//!
//! let db = Database::new(&config.database_path);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let (queue, writer) = persist::spawn_writer(
//!     db, logger.clone(), WriterOptions::default(), shutdown_rx,
//! );
//!
//! let state = Arc::new(AppState::new(config, client, logger, queue));
//! let app = build_router(state);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//!
//! shutdown_tx.send(true)?;
//! writer.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domains;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod normalize;
pub mod parsers;
pub mod persist;
pub mod proxy;
pub mod server;
pub mod store;

pub use config::ProxyConfig;
pub use domains::AuthType;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use normalize::{Conversation, Turn, TurnRole};
pub use server::{build_router, AppState};
