//! Request/response correlation
//!
//! Every outstanding command owns one [`PendingRequest`] keyed by its id.
//! The receive loop resolves entries as `result`/`pong` frames arrive; the
//! caller removes its own entry when it gives up waiting. When the connection
//! leaves `Ready`, [`PendingRequests::fail_all`] fails every entry and closes
//! the map so nothing registered afterwards can hang.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ConnectionError;

/// Final result delivered to a waiting caller
pub type CommandOutcome = std::result::Result<Value, ConnectionError>;

/// An in-flight command awaiting its response
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub created_at: Instant,
    completion: oneshot::Sender<CommandOutcome>,
}

#[derive(Debug, Default)]
struct PendingState {
    entries: HashMap<u64, PendingRequest>,
    closed: bool,
}

/// Map of in-flight commands
#[derive(Debug, Default)]
pub struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight command
    ///
    /// Fails with [`ConnectionError::ConnectionClosed`] once
    /// [`fail_all`](Self::fail_all) has run.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<CommandOutcome>, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        state.entries.insert(
            id,
            PendingRequest {
                id,
                created_at: Instant::now(),
                completion: tx,
            },
        );
        Ok(rx)
    }

    /// Fulfil and remove the entry for `id`
    ///
    /// Returns `false` for unknown ids, e.g. a response arriving after its
    /// caller timed out. Such responses are dropped.
    pub fn resolve(&self, id: u64, outcome: CommandOutcome) -> bool {
        let entry = self.state.lock().entries.remove(&id);
        match entry {
            Some(pending) => {
                tracing::trace!(
                    id,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Resolved pending request"
                );
                // The caller may have stopped waiting between removal and send
                let _ = pending.completion.send(outcome);
                true
            }
            None => {
                tracing::debug!(id, "Dropping response for unknown request id");
                false
            }
        }
    }

    /// Remove an entry without completing it
    pub fn remove(&self, id: u64) -> bool {
        self.state.lock().entries.remove(&id).is_some()
    }

    /// Fail every entry and refuse further registrations
    ///
    /// Returns the number of requests that were failed.
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> ConnectionError,
    {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for pending in drained {
            let _ = pending.completion.send(Err(make_error()));
        }
        if count > 0 {
            tracing::debug!(count, "Failed all pending requests");
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}
