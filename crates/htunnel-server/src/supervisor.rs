//! Engine workers: one background task per running session.
//!
//! A worker outlives the request that started it. The `start` request only
//! waits on the worker's completion signal, so a dropped client connection
//! does not cancel the engine.

use crate::engine::{DnsResolver, EngineConfig, Resolve, TunnelEngine};
use crate::store::{SessionId, SessionStore};
use futures_util::future::join_all;
use htunnel_core::{TunnelError, TunnelResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A live worker, keyed by its generation.
struct Worker {
    session_id: SessionId,
    done: watch::Receiver<bool>,
}

/// Result of asking for a session's engine.
pub enum StartOutcome {
    /// A fresh session and engine were created.
    Started(WorkerHandle),
    /// The session is already running; nothing was changed.
    AlreadyRunning,
}

/// Completion signal of one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    session_id: SessionId,
    done: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait until the worker's engine has stopped.
    pub async fn wait(mut self) {
        worker_done(&mut self.done).await;
    }
}

/// Owns every engine worker.
pub struct TunnelSupervisor<R = DnsResolver> {
    store: Arc<SessionStore>,
    engine: EngineConfig,
    resolver: Arc<R>,
    workers: Mutex<HashMap<u64, Worker>>,
    next_generation: AtomicU64,
}

impl<R: Resolve> TunnelSupervisor<R> {
    pub fn new(store: Arc<SessionStore>, engine: EngineConfig, resolver: R) -> Self {
        Self {
            store,
            engine,
            resolver: Arc::new(resolver),
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Create the session `id` and spawn its engine, unless it already runs.
    pub async fn start(self: &Arc<Self>, id: &str) -> TunnelResult<StartOutcome> {
        let cell = match self.store.create(id).await {
            Ok(cell) => cell,
            Err(TunnelError::SessionExists(_)) => {
                debug!(session_id = %id, "start ignored, session already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(e) => return Err(e),
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);
        let engine = TunnelEngine::new(id.to_string(), cell, &self.engine, self.resolver.clone());

        let live = {
            let mut workers = self.workers.lock().await;
            workers.insert(
                generation,
                Worker {
                    session_id: id.to_string(),
                    done: done_rx.clone(),
                },
            );
            workers.len()
        };

        let supervisor = Arc::clone(self);
        let session_id = id.to_string();
        let task: JoinHandle<u64> = tokio::spawn(engine.run());
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(session_id = %session_id, error = %e, "engine task failed");
                // leave no running session without an engine behind
                if let Ok(mut session) = supervisor.store.acquire(&session_id).await {
                    session.stop();
                }
            }
            supervisor.retire(generation).await;
            let _ = done_tx.send(true);
        });

        info!(session_id = %id, generation, live_workers = live, "engine started");
        Ok(StartOutcome::Started(WorkerHandle {
            session_id: id.to_string(),
            done: done_rx,
        }))
    }

    async fn retire(&self, generation: u64) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.remove(&generation) {
            debug!(
                session_id = %worker.session_id,
                generation,
                live_workers = workers.len(),
                "worker retired"
            );
        }
    }

    /// Number of engines still running.
    pub async fn live_workers(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Stop every session and wait up to `timeout` for the engines to exit.
    ///
    /// Returns `true` if every worker finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let stopped = self.store.stop_all().await;
        let pending: Vec<watch::Receiver<bool>> = self
            .workers
            .lock()
            .await
            .values()
            .map(|w| w.done.clone())
            .collect();
        info!(sessions = stopped, workers = pending.len(), "stopping engines");

        let all_done = join_all(
            pending
                .into_iter()
                .map(|mut done| async move { worker_done(&mut done).await }),
        );

        match tokio::time::timeout(timeout, all_done).await {
            Ok(_) => true,
            Err(_) => {
                let remaining = self.live_workers().await;
                warn!(remaining, "engines still running at shutdown");
                false
            }
        }
    }
}

/// Resolves once the worker behind `done` has finished. A closed channel
/// means the worker is gone, which counts as finished.
async fn worker_done(done: &mut watch::Receiver<bool>) {
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

/// Periodically destroy sessions idle for longer than `idle_timeout`.
pub fn spawn_gc(
    store: Arc<SessionStore>,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = store.reap_idle(idle_timeout).await;
            if !reaped.is_empty() {
                let remaining = store.count().await;
                info!(count = reaped.len(), remaining, "idle sessions reaped");
            }
        }
    })
}
