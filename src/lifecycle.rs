use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::server::{Server, ServerError};
use crate::session::SessionTable;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("backend {name} failed to start: {source}")]
    Backend {
        name: &'static str,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("backend startup worker failed: {0}")]
    Worker(String),
}

/// Cloneable trigger for an orderly stop. Only the first call does anything.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
    stopping: Arc<AtomicBool>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns false when a stop was already requested.
    pub fn stop(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return false;
        }
        info!("Shutdown requested");
        self.tx.send_replace(true);
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Owns the session table and brings the whole server up and down in order:
/// backend, listener, sweeper on the way up; listener, connections, sweeper,
/// sessions, backend on the way down.
pub struct Lifecycle<B: Backend> {
    config: ServerConfig,
    sessions: Arc<SessionTable<B>>,
    stop: StopHandle,
}

impl<B: Backend> Lifecycle<B> {
    pub fn new(config: ServerConfig, backend: B) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionTable::new(Arc::new(backend))),
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &Arc<SessionTable<B>> {
        &self.sessions
    }

    pub async fn start(&self) -> Result<Running, StartupError> {
        let backend = Arc::clone(self.sessions.backend());
        let name = backend.name();
        info!("Starting {} backend", name);
        tokio::task::spawn_blocking(move || backend.startup())
            .await
            .map_err(|e| StartupError::Worker(e.to_string()))?
            .map_err(|source| StartupError::Backend { name, source })?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.sessions),
            self.config.default_session.clone(),
        ));
        let bound = Server::bind(
            &self.config.listen_address,
            dispatcher,
            self.config.max_frame_size,
            self.config.shutdown_grace(),
        )
        .await
        .and_then(|server| {
            let addr = server.local_addr()?;
            Ok((server, addr))
        });
        let (server, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                shutdown_backend(self.sessions.backend()).await;
                return Err(e.into());
            }
        };

        let sweeper = self.sessions.spawn_sweeper(
            self.config.sweep_interval(),
            self.config.idle_ttl(),
            self.stop.subscribe(),
        );
        let sessions = Arc::clone(&self.sessions);
        let grace = self.config.shutdown_grace();
        let shutdown = self.stop.subscribe();
        let task = tokio::spawn(async move {
            server.serve(shutdown).await;

            sweeper.abort();
            let _ = sweeper.await;

            debug!("Releasing {} sessions", sessions.len().await);
            let released = sessions.clear(grace).await;
            info!("Released {} sessions", released);
            shutdown_backend(sessions.backend()).await;
            info!("Shutdown complete");
        });

        Ok(Running { local_addr, task })
    }

    /// Start, stop on SIGINT/SIGTERM, and return once shutdown has finished.
    pub async fn run(&self) -> Result<(), StartupError> {
        let running = self.start().await?;
        info!("mindmapd ready on {}", running.local_addr());
        let signals = tokio::spawn(watch_signals(self.stop_handle()));
        running.wait().await;
        signals.abort();
        Ok(())
    }
}

pub struct Running {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Shutdown task failed: {}", e);
        }
    }
}

async fn shutdown_backend<B: Backend>(backend: &Arc<B>) {
    let backend = Arc::clone(backend);
    if let Err(e) = tokio::task::spawn_blocking(move || backend.shutdown()).await {
        error!("Backend shutdown failed: {}", e);
    }
}

async fn watch_signals(stop: StopHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.stop();
                }
                return;
            }
        };
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!("Cannot listen for Ctrl-C: {}", e);
                        return;
                    }
                    info!("Received interrupt");
                }
                _ = terminate.recv() => info!("Received terminate signal"),
            }
            stop.stop();
        }
    }

    #[cfg(not(unix))]
    while tokio::signal::ctrl_c().await.is_ok() {
        info!("Received interrupt");
        stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::StubBackend;
    use crate::client::Client;
    use serde_json::json;
    use std::time::Duration;

    fn local_config() -> ServerConfig {
        ServerConfig {
            listen_address: "127.0.0.1:0".to_string(),
            shutdown_grace_ms: 200,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn start_serve_and_stop_releases_everything() {
        let lifecycle = Lifecycle::new(local_config(), StubBackend::default());
        let running = lifecycle.start().await.unwrap();
        let addr = running.local_addr();

        let mut client = Client::connect(addr).await.unwrap();
        for _ in 0..2 {
            let created = client.call("create_session", json!({})).await.unwrap();
            assert!(created.success);
        }
        assert_eq!(lifecycle.sessions().len().await, 2);

        assert!(lifecycle.stop_handle().stop());
        tokio::time::timeout(Duration::from_secs(2), running.wait())
            .await
            .unwrap();

        let backend = lifecycle.sessions().backend();
        assert_eq!(lifecycle.sessions().len().await, 0);
        assert_eq!(backend.released_count(), 2);
        assert!(backend.shut_down.load(Ordering::SeqCst));
        assert!(client.read_response().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_finishes_while_a_backend_call_hangs() {
        let backend = StubBackend::with_delay(Duration::from_millis(1500));
        let lifecycle = Lifecycle::new(local_config(), backend);
        let running = lifecycle.start().await.unwrap();
        let addr = running.local_addr();

        let mut client = Client::connect(addr).await.unwrap();
        let created = client.call("create_session", json!({})).await.unwrap();
        let id = created.data.unwrap()["session_id"].as_str().unwrap().to_string();
        let hung = tokio::spawn(async move {
            let _ = client.call("get_mindmap", json!({ "session_id": id })).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(lifecycle.stop_handle().stop());
        tokio::time::timeout(Duration::from_millis(1000), running.wait())
            .await
            .unwrap();

        let backend = lifecycle.sessions().backend();
        assert_eq!(lifecycle.sessions().len().await, 0);
        assert!(backend.shut_down.load(Ordering::SeqCst));
        let _ = hung.await;
    }

    #[tokio::test]
    async fn second_stop_is_a_no_op() {
        let lifecycle = Lifecycle::new(local_config(), StubBackend::default());
        let running = lifecycle.start().await.unwrap();
        let handle = lifecycle.stop_handle();

        assert!(handle.stop());
        assert!(!handle.stop());
        assert!(!lifecycle.stop_handle().stop());
        running.wait().await;
    }

    #[tokio::test]
    async fn backend_startup_failure_aborts_start() {
        let backend = StubBackend::failing_startup();
        let lifecycle = Lifecycle::new(local_config(), backend);

        let err = lifecycle.start().await.err().unwrap();
        assert!(matches!(err, StartupError::Backend { name: "stub", .. }));
        assert_eq!(
            err.to_string(),
            "backend stub failed to start: Failed to initialize backend: stub refused to start"
        );
    }

    #[tokio::test]
    async fn bind_failure_shuts_backend_down() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            listen_address: taken.local_addr().unwrap().to_string(),
            ..local_config()
        };
        let lifecycle = Lifecycle::new(config, StubBackend::default());

        let err = lifecycle.start().await.err().unwrap();
        assert!(matches!(err, StartupError::Server(ServerError::Bind { .. })));
        assert!(lifecycle.sessions().backend().shut_down.load(Ordering::SeqCst));
    }
}
