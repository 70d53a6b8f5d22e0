//! # netsched-server - HTTP API and maintenance runner
//!
//! This crate runs a netsched queue registry behind an HTTP/JSON API and
//! drives its background maintenance (execution timeouts, Returned sweep,
//! listener notifications, purge).
//!
//! ## Endpoints
//!
//! - Health check (`GET /health`)
//! - Queues (`GET /api/queues`, `GET /api/queues/{queue}/stats`,
//!   `PUT /api/queues/{queue}/config`)
//! - Submitters (`POST /api/queues/{queue}/jobs`, `.../jobs/batch`,
//!   `GET|DELETE .../jobs/{id}`, `POST .../jobs/{id}/cancel`)
//! - Workers (`POST /api/queues/{queue}/get`, `.../exchange`,
//!   `.../jobs/{id}/put`, `.../jobs/{id}/fail`, `.../jobs/{id}/return`)
//! - Administration (`GET .../jobs?status=`, `DELETE .../jobs`,
//!   `POST .../cancel?status=`, `POST .../jobs/{id}/reschedule`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use netsched_core::QueueConfig;
//! use netsched_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> netsched_core::Result<()> {
//!     let config = ServerConfig::builder()
//!         .bind_addr(([0, 0, 0, 0], 9100).into())
//!         .database_url("sqlite://netsched.db")
//!         .queue(QueueConfig::builder("render").timeout(600).build())
//!         .build();
//!
//!     Server::new(config).run().await
//! }
//! ```

mod api;
mod config;
mod server;

pub use api::{configure, ApiError, AppState};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::Server;
