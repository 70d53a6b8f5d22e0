//! Server implementation that runs the API and queue maintenance concurrently.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use netsched_core::{Maintenance, QueueContext, QueueRegistry, Result, SharedStore};
use netsched_sqlite::SqliteStore;
use tokio::sync::Notify;

use crate::api::{self, AppState};
use crate::config::ServerConfig;

/// The netsched server: the HTTP API plus background maintenance over one
/// queue registry.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run until Ctrl-C or a fatal store error.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Open the SQLite store, mount the configured queues and serve until
    /// `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let store = SqliteStore::new(&self.config.database_url).await?;
        let context = QueueContext::builder(SharedStore::new(store))
            .engine(self.config.engine.clone())
            .build();
        let registry = QueueRegistry::open(context, self.config.queues.clone()).await?;
        self.serve(registry, shutdown).await
    }

    /// Serve an already opened registry.
    ///
    /// Returns the error of the first maintenance task that failed fatally.
    /// A request hitting a fatal store error also stops the server.
    pub async fn serve<S>(self, registry: Arc<QueueRegistry>, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let fatal = Arc::new(Notify::new());
        let app_state = web::Data::new(AppState::new(registry.clone(), fatal.clone()));

        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(api::configure)
        })
        .bind(self.config.bind_addr)?
        .disable_signals()
        .shutdown_timeout(self.config.shutdown_timeout.as_secs())
        .run();
        let server_handle = server.handle();

        let api_handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "API server error");
            }
        });

        tracing::info!(
            addr = %self.config.bind_addr,
            queues = registry.len(),
            "API server started"
        );

        let maintenance = Maintenance::new(registry);
        let result = maintenance
            .run_until(async move {
                tokio::select! {
                    _ = shutdown => {}
                    _ = fatal.notified() => {
                        tracing::error!("Unrecoverable store error, shutting down");
                    }
                }
            })
            .await;

        tracing::info!("Shutting down API server...");
        server_handle.stop(true).await;
        let _ = api_handle.await;

        tracing::info!("Server stopped");
        result
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsched_core::{
        JobSubmission, ManualClock, MemoryStore, NsError, PersistentStore, QueueConfig,
        RecordingNotifier,
    };
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .bind_addr_str("127.0.0.1:0")
            .unwrap()
            .database_url("sqlite::memory:")
            .queue(QueueConfig::builder("jobs").build())
            .shutdown_timeout(Duration::from_secs(1))
            .build()
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = Server::new(config());
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            server.run_until(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_rejects_bad_database_url() {
        let server = Server::new(
            ServerConfig::builder()
                .database_url("sqlite:///nonexistent-dir/sub/netsched.db")
                .build(),
        );
        assert!(server.run_until(std::future::pending()).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_corruption() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1000));
        let mut engine = netsched_core::EngineConfig::default();
        engine.watcher_interval = Duration::from_millis(10);
        let context = QueueContext::builder(SharedStore::from_arc(store.clone()))
            .engine(engine)
            .clock(clock.clone())
            .notifier(Arc::new(RecordingNotifier::new()))
            .build();
        let registry = QueueRegistry::open(
            context,
            vec![QueueConfig::builder("jobs").run_timeout(1).build()],
        )
        .await
        .unwrap();
        let q = registry.get("jobs").unwrap();
        q.submit("client", JobSubmission::new("x")).await.unwrap();
        q.get_job(&netsched_core::WorkerNode::new("w", 1), &[])
            .await
            .unwrap()
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put("jobs_jobs", 1, b"garbage").await.unwrap();
        tx.commit().await.unwrap();
        clock.advance(5);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            Server::new(config()).serve(registry, std::future::pending()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(NsError::Corruption(_))));
    }
}
