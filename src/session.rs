use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::config::SessionConfig;
use crate::utils::shutdown::wait_for_stop;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Failed to create session: {0}")]
    BackendInit(#[source] BackendError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Backend worker failed: {0}")]
    Worker(String),
}

/// One live session. The backend handle sits behind an async mutex so calls
/// against the same session are serialized no matter which connection
/// issues them.
pub struct Session<B: Backend> {
    id: String,
    config: SessionConfig,
    handle: Arc<Mutex<Option<B::Handle>>>,
}

impl<B: Backend> Session<B> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run one backend call on a worker thread while holding the session lock.
    /// If the caller goes away the call still runs to completion.
    pub async fn execute(
        &self,
        backend: &Arc<B>,
        action: &str,
        params: Map<String, Value>,
    ) -> Result<Value, SessionError> {
        let mut guard = Arc::clone(&self.handle).lock_owned().await;
        let backend = Arc::clone(backend);
        let action = action.to_string();

        tokio::task::spawn_blocking(move || {
            let handle = guard.as_mut().ok_or(BackendError::Released)?;
            backend.execute(handle, &action, &params)
        })
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?
        .map_err(SessionError::from)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub charttype: String,
    pub turbo_mode: bool,
    pub idle_seconds: u64,
}

struct Slot<B: Backend> {
    session: Arc<Session<B>>,
    last_accessed: Instant,
}

impl<B: Backend> Slot<B> {
    fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            session_id: self.session.id().to_string(),
            charttype: self.session.config().charttype.clone(),
            turbo_mode: self.session.config().turbo_mode,
            idle_seconds: now.saturating_duration_since(self.last_accessed).as_secs(),
        }
    }
}

/// All live sessions, keyed by id. Every create/get/delete/sweep goes
/// through here.
pub struct SessionTable<B: Backend> {
    backend: Arc<B>,
    sessions: RwLock<HashMap<String, Slot<B>>>,
}

impl<B: Backend> SessionTable<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn create(&self, config: SessionConfig) -> Result<String, SessionError> {
        let backend = Arc::clone(&self.backend);
        let init_config = config.clone();
        let handle = tokio::task::spawn_blocking(move || backend.init(&init_config))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))?
            .map_err(SessionError::BackendInit)?;

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session {
            id: id.clone(),
            config,
            handle: Arc::new(Mutex::new(Some(handle))),
        });

        self.sessions.write().await.insert(
            id.clone(),
            Slot {
                session,
                last_accessed: Instant::now(),
            },
        );
        info!("Created session {}", id);
        Ok(id)
    }

    /// Look up a session and mark it as used.
    pub async fn get(&self, id: &str) -> Result<Arc<Session<B>>, SessionError> {
        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        slot.last_accessed = Instant::now();
        Ok(Arc::clone(&slot.session))
    }

    pub async fn info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let sessions = self.sessions.read().await;
        let slot = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(slot.info(Instant::now()))
    }

    /// Does not touch any session.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|slot| slot.info(now)).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Resolve `id` and run one backend action against it.
    pub async fn execute(
        &self,
        id: &str,
        action: &str,
        params: Map<String, Value>,
    ) -> Result<Value, SessionError> {
        let session = self.get(id).await?;
        session.execute(&self.backend, action, params).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let slot = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        release(Arc::clone(&self.backend), slot.session).await?;
        info!("Deleted session {}", id);
        Ok(())
    }

    /// Evict every session idle for longer than `idle_ttl` as of `now`.
    /// Returns how many were evicted.
    ///
    /// Evicted sessions are released concurrently, so a session stuck in a
    /// backend call only delays its own release.
    pub async fn sweep(&self, idle_ttl: Duration, now: Instant) -> usize {
        let expired: Vec<Arc<Session<B>>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, slot)| now.saturating_duration_since(slot.last_accessed) > idle_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| sessions.remove(id))
                .map(|slot| slot.session)
                .collect()
        };

        let count = expired.len();
        let mut releases = self.spawn_releases(expired);
        while let Some(done) = releases.join_next().await {
            if let Some(id) = finish_release(done) {
                info!("Removed inactive session {}", id);
            }
        }
        count
    }

    /// Release every session; used at shutdown. Sessions still busy after
    /// `grace` are logged and left behind.
    pub async fn clear(&self, grace: Duration) -> usize {
        let drained: Vec<Arc<Session<B>>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, slot)| slot.session)
            .collect();
        let count = drained.len();
        let mut pending: HashSet<String> = drained.iter().map(|s| s.id.clone()).collect();

        let mut releases = self.spawn_releases(drained);
        let finished = tokio::time::timeout(grace, async {
            while let Some(done) = releases.join_next().await {
                if let Some(id) = finish_release(done) {
                    pending.remove(&id);
                }
            }
        })
        .await;
        if finished.is_err() {
            let mut left: Vec<&String> = pending.iter().collect();
            left.sort();
            warn!("Left {} sessions unreleased after {:?}: {:?}", left.len(), grace, left);
        }
        count
    }

    fn spawn_releases(&self, sessions: Vec<Arc<Session<B>>>) -> JoinSet<ReleaseOutcome> {
        let mut releases = JoinSet::new();
        for session in sessions {
            let backend = Arc::clone(&self.backend);
            releases.spawn(async move {
                let id = session.id.clone();
                let result = release(backend, session).await;
                (id, result)
            });
        }
        releases
    }

    /// Periodically evict idle sessions until `shutdown` flips to true.
    /// Each sweep runs as its own task so a stalled release never holds up
    /// the next tick.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        idle_ttl: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            let mut sweeps = JoinSet::new();
            loop {
                tokio::select! {
                    _ = wait_for_stop(&mut shutdown) => {
                        debug!("Session sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let table = Arc::clone(&table);
                        sweeps.spawn(async move {
                            let evicted = table.sweep(idle_ttl, Instant::now()).await;
                            if evicted > 0 {
                                debug!("Sweep evicted {} sessions", evicted);
                            }
                        });
                    }
                    Some(done) = sweeps.join_next(), if !sweeps.is_empty() => {
                        if let Err(e) = done {
                            error!("Sweep task failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

type ReleaseOutcome = (String, Result<(), SessionError>);

/// Waits for any in-flight call on the session before giving the handle
/// back to the backend.
async fn release<B: Backend>(
    backend: Arc<B>,
    session: Arc<Session<B>>,
) -> Result<(), SessionError> {
    let handle = session.handle.lock().await.take();
    if let Some(handle) = handle {
        tokio::task::spawn_blocking(move || backend.release(handle))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))?;
    }
    Ok(())
}

fn finish_release(done: Result<ReleaseOutcome, JoinError>) -> Option<String> {
    match done {
        Ok((id, Ok(()))) => Some(id),
        Ok((id, Err(e))) => {
            error!("Failed to release session {}: {}", id, e);
            Some(id)
        }
        Err(e) => {
            error!("Session release task failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::StubBackend;
    use std::sync::atomic::Ordering;

    fn table(backend: StubBackend) -> (Arc<StubBackend>, Arc<SessionTable<StubBackend>>) {
        let backend = Arc::new(backend);
        let table = Arc::new(SessionTable::new(Arc::clone(&backend)));
        (backend, table)
    }

    #[tokio::test]
    async fn lifecycle_create_get_delete() {
        let (backend, table) = table(StubBackend::default());
        let id = table.create(SessionConfig::default()).await.unwrap();

        let session = table.get(&id).await.unwrap();
        assert_eq!(session.id(), id);
        assert_eq!(session.config().charttype, "auto");

        table.delete(&id).await.unwrap();
        assert_eq!(backend.released_count(), 1);
        assert!(matches!(table.get(&id).await, Err(SessionError::NotFound(_))));
        assert!(matches!(table.delete(&id).await, Err(SessionError::NotFound(_))));
        assert_eq!(backend.released_count(), 1);
    }

    #[tokio::test]
    async fn failed_init_stores_nothing() {
        let (backend, table) = table(StubBackend::default());
        backend.fail_init.store(true, Ordering::SeqCst);

        let err = table.create(SessionConfig::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::BackendInit(_)));
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn sessions_have_their_own_handles() {
        let (_backend, table) = table(StubBackend::default());
        let a = table.create(SessionConfig::default()).await.unwrap();
        let b = table
            .create(SessionConfig {
                charttype: "radial".into(),
                turbo_mode: true,
            })
            .await
            .unwrap();
        assert_ne!(a, b);

        table.execute(&a, "get_mindmap", Map::new()).await.unwrap();
        let second_a = table.execute(&a, "get_mindmap", Map::new()).await.unwrap();
        let first_b = table.execute(&b, "get_mindmap", Map::new()).await.unwrap();

        assert_eq!(second_a["calls"], 2);
        assert_eq!(first_b["calls"], 1);
        assert_ne!(second_a["handle"], first_b["handle"]);
        assert_eq!(first_b["charttype"], "radial");
    }

    #[tokio::test]
    async fn backend_failure_keeps_session() {
        let (_backend, table) = table(StubBackend::default());
        let id = table.create(SessionConfig::default()).await.unwrap();

        let err = table.execute(&id, "fail", Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "stub failure");
        assert!(table.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_sessions() {
        let (backend, table) = table(StubBackend::default());
        let ttl = Duration::from_secs(60);
        let idle = table.create(SessionConfig::default()).await.unwrap();
        let busy = table.create(SessionConfig::default()).await.unwrap();

        assert_eq!(table.sweep(ttl, Instant::now() + ttl / 2).await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        table.get(&busy).await.unwrap();
        assert_eq!(table.info(&busy).await.unwrap().idle_seconds, 0);

        // Past idle's deadline, still inside busy's.
        let now = Instant::now() + ttl - Duration::from_millis(25);
        assert_eq!(table.sweep(ttl, now).await, 1);

        assert!(matches!(table.get(&idle).await, Err(SessionError::NotFound(_))));
        assert!(table.get(&busy).await.is_ok());
        assert_eq!(backend.released_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_session_calls_never_overlap() {
        let (backend, table) = table(StubBackend::with_delay(Duration::from_millis(30)));
        let id = table.create(SessionConfig::default()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                table.execute(&id, "get_mindmap", Map::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(backend.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_sessions_run_concurrently() {
        let (backend, table) = table(StubBackend::with_delay(Duration::from_millis(100)));
        let a = table.create(SessionConfig::default()).await.unwrap();
        let b = table.create(SessionConfig::default()).await.unwrap();

        let (ra, rb) = tokio::join!(
            table.execute(&a, "get_mindmap", Map::new()),
            table.execute(&b, "get_mindmap", Map::new()),
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(backend.max_concurrent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_shutdown() {
        let (backend, table) = table(StubBackend::default());
        table.create(SessionConfig::default()).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let sweeper = table.spawn_sweeper(Duration::from_millis(10), Duration::from_millis(1), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(table.len().await, 0);
        assert_eq!(backend.released_count(), 1);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn clear_releases_everything() {
        let (backend, table) = table(StubBackend::default());
        for _ in 0..3 {
            table.create(SessionConfig::default()).await.unwrap();
        }
        assert_eq!(table.list().await.len(), 3);
        assert_eq!(table.clear(Duration::from_secs(1)).await, 3);
        assert_eq!(backend.released_count(), 3);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn failed_release_does_not_stop_the_sweep() {
        let (backend, table) = table(StubBackend::panicking_release(1));
        for _ in 0..3 {
            table.create(SessionConfig::default()).await.unwrap();
        }

        let ttl = Duration::from_secs(60);
        assert_eq!(table.sweep(ttl, Instant::now() + ttl * 2).await, 3);

        assert_eq!(table.len().await, 0);
        assert_eq!(backend.released_ids(), vec![0, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn busy_session_does_not_hold_up_other_releases() {
        let (backend, table) = table(StubBackend::with_delay(Duration::from_millis(600)));
        let busy = table.create(SessionConfig::default()).await.unwrap();
        for _ in 0..2 {
            table.create(SessionConfig::default()).await.unwrap();
        }

        let call = {
            let table = Arc::clone(&table);
            let busy = busy.clone();
            tokio::spawn(async move { table.execute(&busy, "get_mindmap", Map::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ttl = Duration::from_secs(60);
        let sweep = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.sweep(ttl, Instant::now() + ttl * 2).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(table.len().await, 0);
        assert_eq!(backend.released_count(), 2);
        assert!(!sweep.is_finished());

        assert_eq!(sweep.await.unwrap(), 3);
        call.await.unwrap().unwrap();
        assert_eq!(backend.released_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_gives_up_on_busy_sessions_after_grace() {
        let (backend, table) = table(StubBackend::with_delay(Duration::from_millis(800)));
        let busy = table.create(SessionConfig::default()).await.unwrap();
        table.create(SessionConfig::default()).await.unwrap();

        let call = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.execute(&busy, "get_mindmap", Map::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(table.clear(Duration::from_millis(100)).await, 2);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(table.len().await, 0);
        assert_eq!(backend.released_count(), 1);

        call.await.unwrap().unwrap();
    }
}
