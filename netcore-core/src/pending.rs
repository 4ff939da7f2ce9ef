//! Pending call table: correlates synced requests with their responses.
//!
//! The calling thread registers and then blocks on its own receiver; the reliable channel's
//! listener thread completes entries. The table lock is held only for insert, lookup and
//! remove, never across the wait.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::NetCoreError;
use crate::protocol::{CorrelationId, Value};

/// What a waiting caller is woken with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CallOutcome {
    Returned(Option<Value>),
    LinkLost,
}

/// Wait handle for one in-flight synced call.
#[derive(Debug)]
pub struct PendingCall {
    id: CorrelationId,
    rx: Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CorrelationId, SyncSender<CallOutcome>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, SyncSender<CallOutcome>>> {
        // A panic elsewhere can't leave the map half-updated; keep serving.
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh correlation id and insert its entry.
    pub fn register(&self) -> PendingCall {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut calls = self.lock();
        let mut id = CorrelationId::generate();
        while calls.contains_key(&id) {
            id = CorrelationId::generate();
        }
        calls.insert(id, tx);
        PendingCall { id, rx }
    }

    /// Fill the result slot and wake the caller. Returns false for an unknown (stale) id.
    pub fn complete(&self, id: CorrelationId, value: Option<Value>) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            return false;
        };
        tx.try_send(CallOutcome::Returned(value)).is_ok()
    }

    /// Drop an entry whose request never made it onto the wire.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Wake every waiting caller with `LinkLost`. Returns how many were outstanding.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.try_send(CallOutcome::LinkLost);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the call completes, the link is lost, or `timeout` elapses.
    /// On timeout the entry is removed so a late response is ignored.
    pub fn wait(
        &self,
        call: PendingCall,
        timeout: Duration,
    ) -> Result<Option<Value>, NetCoreError> {
        match call.rx.recv_timeout(timeout) {
            Ok(CallOutcome::Returned(value)) => Ok(value),
            Ok(CallOutcome::LinkLost) => Err(NetCoreError::LinkLost),
            Err(RecvTimeoutError::Timeout) => {
                self.cancel(call.id);
                // The response may have raced the removal.
                match call.rx.try_recv() {
                    Ok(CallOutcome::Returned(value)) => Ok(value),
                    Ok(CallOutcome::LinkLost) => Err(NetCoreError::LinkLost),
                    Err(_) => Err(NetCoreError::Timeout(timeout)),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(NetCoreError::LinkLost),
        }
    }
}
