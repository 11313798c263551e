//! Process-wide session registry with idle reaping

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::metrics::Metrics;
use crate::session::Session;

/// Registry of live sessions keyed by thread id.
pub struct SessionManager {
    sessions: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<Session>>>>,
    next_thread_id: AtomicU32,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_thread_id: AtomicU32::new(1),
            metrics,
        }
    }

    /// Allocate a thread id and register a fresh session.
    pub fn create(&self) -> Arc<tokio::sync::Mutex<Session>> {
        let thread_id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(tokio::sync::Mutex::new(Session::new(thread_id)));
        self.sessions
            .lock()
            .unwrap()
            .insert(thread_id, Arc::clone(&session));
        self.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.metrics.active_sessions.fetch_add(1, Ordering::Relaxed);
        session
    }

    pub fn remove(&self, thread_id: u32) {
        if self.sessions.lock().unwrap().remove(&thread_id).is_some() {
            self.metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// One GC pass: drop sessions idle beyond `max_age`. The connection task
    /// notices the removal on its next command and closes.
    pub async fn gc_pass(&self, max_age: Duration) -> usize {
        let candidates: Vec<(u32, Arc<tokio::sync::Mutex<Session>>)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
        };
        let mut reaped = 0;
        for (thread_id, session) in candidates {
            let idle = session.lock().await.idle_for();
            if idle > max_age {
                self.remove(thread_id);
                reaped += 1;
                tracing::debug!(thread_id, idle_secs = idle.as_secs(), "Reaped idle session");
            }
        }
        reaped
    }

    /// Whether the session is still registered; used by connection tasks to
    /// detect reaping.
    pub fn is_live(&self, thread_id: u32) -> bool {
        self.sessions.lock().unwrap().contains_key(&thread_id)
    }

    /// Long-lived GC task, cancelled through the shutdown channel.
    pub async fn run_gc(
        self: Arc<Self>,
        config: SessionConfig,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(config.gc_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.gc_pass(config.max_age).await;
                    if reaped > 0 {
                        tracing::info!(reaped, "Session GC pass complete");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Session GC task shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_remove() {
        let manager = SessionManager::new(Arc::new(Metrics::new()));
        let s1 = manager.create();
        let s2 = manager.create();
        assert_ne!(s1.lock().await.thread_id, s2.lock().await.thread_id);
        assert_eq!(manager.active_count(), 2);
        let id = s1.lock().await.thread_id;
        manager.remove(id);
        assert_eq!(manager.active_count(), 1);
        assert!(!manager.is_live(id));
    }

    #[tokio::test]
    async fn test_gc_reaps_only_idle() {
        let manager = SessionManager::new(Arc::new(Metrics::new()));
        let fresh = manager.create();
        let stale = manager.create();
        {
            let mut s = stale.lock().await;
            s.last_active = std::time::Instant::now() - Duration::from_secs(120);
        }
        let reaped = manager.gc_pass(Duration::from_secs(60)).await;
        assert_eq!(reaped, 1);
        assert!(manager.is_live(fresh.lock().await.thread_id));
    }
}
