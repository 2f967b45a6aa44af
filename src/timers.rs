use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Cancellable one-shot timers keyed by session id. At most one timer is
/// armed per session; arming again replaces the previous one.
#[derive(Debug, Default)]
pub struct DelayTimers {
    next_generation: AtomicU64,
    armed: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
}

impl DelayTimers {
    /// Reserve a generation for a timer about to be armed. The fired task
    /// passes it back to [`DelayTimers::disarm`] so a replaced timer never
    /// removes its successor.
    pub fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn arm(&self, key: &str, generation: u64, delay: Duration, task: BoxFuture<'static, ()>) {
        // spawn under the lock so a zero-delay task cannot disarm before it is registered
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let previous = armed.insert(key.to_string(), (generation, handle));
        drop(armed);
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Called by a fired timer before it does its work.
    pub fn disarm(&self, key: &str, generation: u64) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if armed.get(key).map(|(g, _)| *g == generation).unwrap_or(false) {
            armed.remove(key);
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
