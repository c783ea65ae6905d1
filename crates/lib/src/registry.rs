//! Live set of procedures. Owned explicitly and shared with a dispatcher, so several dispatchers
//! (or a test) can each hold their own.

use crate::message::Message;
use crate::procedure::Procedure;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Lock-guarded collection of procedures, scanned linearly.
pub struct ProcedureRegistry {
    inner: Mutex<Vec<Arc<Procedure>>>,
}

impl Default for ProcedureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Exclusive access for one routing decision (scan, reclaim, register).
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Vec<Arc<Procedure>>> {
        self.inner.lock().await
    }

    /// Entries currently held, finished ones included until the next dispatch reclaims them.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Procedure>> {
        self.inner.lock().await.clone()
    }

    /// The running procedure that would receive `msg`, if any.
    pub async fn find_match(&self, msg: &Message) -> Option<Arc<Procedure>> {
        self.inner
            .lock()
            .await
            .iter()
            .find(|p| !p.is_finished() && p.is_my_msg(msg))
            .cloned()
    }

    /// Abort every running procedure (e.g. on shutdown). Returns how many were aborted.
    pub async fn abort_all(&self) -> usize {
        let g = self.inner.lock().await;
        g.iter().filter(|p| p.abort().is_ok()).count()
    }
}
