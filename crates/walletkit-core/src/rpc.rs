use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::{CallEnvelope, ResponseEnvelope};
use crate::error::BridgeError;
use crate::transport::Transport;

type Completion = oneshot::Sender<Result<Value, BridgeError>>;
type PendingCalls = HashMap<String, PendingCall>;

/// An issued call awaiting its response.
struct PendingCall {
    method: String,
    created_at: Instant,
    completion: Completion,
}

/// Correlates calls sent over a [`Transport`] with the responses that come
/// back on the inbound stream.
///
/// # Completion
///
/// Every pending call completes at most once. Completion removes the entry
/// from the pending map under the lock before the result is delivered, so a
/// duplicate response finds nothing and is discarded. A caller that stops
/// awaiting (cancellation, timeout) removes its own entry on drop.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pending: Mutex<PendingCalls>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `method` with `params` and wait for the matching response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        let id = format!("call_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.lock_pending();
            // Checked under the lock so a concurrent destroy either sees this
            // entry in fail_all or we see the flag here.
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(BridgeError::Destroyed);
            }
            pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    created_at: Instant::now(),
                    completion: tx,
                },
            );
        }
        let _guard = PendingGuard {
            client: self,
            id: &id,
        };

        let envelope = CallEnvelope::new(id.clone(), method, params);
        tracing::debug!(id, method, transport = self.transport.name(), "Sending bridge call");
        self.transport.send(&envelope).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Transport(format!(
                "response channel closed for {method} ({id})"
            ))),
        }
    }

    /// Complete the pending call matching `response.id`.
    ///
    /// Returns `false` when no call was waiting (unknown, duplicate, or
    /// already failed); such responses are logged and dropped.
    pub fn handle_response(&self, response: ResponseEnvelope) -> bool {
        let Some(call) = self.take(&response.id) else {
            tracing::warn!(id = %response.id, "Discarding response with no pending call");
            return false;
        };

        let result = response.outcome.map_err(|message| BridgeError::Js {
            method: call.method.clone(),
            message,
        });
        tracing::debug!(
            id = %response.id,
            method = %call.method,
            ok = result.is_ok(),
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "Bridge call completed"
        );
        if call.completion.send(result).is_err() {
            tracing::debug!(id = %response.id, "Caller no longer awaiting response");
        }
        true
    }

    /// Handle a payload that could not be decoded.
    ///
    /// With a recoverable id only that call fails; otherwise the payload is
    /// treated as noise and every pending call is left alone.
    pub fn handle_malformed(&self, id: Option<&str>, reason: &str) -> bool {
        match id {
            Some(id) => {
                let failed = self.fail_call(id, BridgeError::MalformedResponse(reason.to_string()));
                if !failed {
                    tracing::warn!(id, reason, "Malformed payload for unknown call, ignoring");
                }
                failed
            }
            None => {
                tracing::warn!(reason, "Ignoring malformed payload without a recoverable id");
                false
            }
        }
    }

    /// Fail a single pending call.
    pub fn fail_call(&self, id: &str, error: BridgeError) -> bool {
        match self.take(id) {
            Some(call) => {
                tracing::warn!(id, method = %call.method, error = %error, "Failing bridge call");
                let _ = call.completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with `error` and clear the map.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<(String, PendingCall)> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), error = %error, "Failing all pending bridge calls");
        }
        let count = drained.len();
        for (_, call) in drained {
            let _ = call.completion.send(Err(error.clone()));
        }
        count
    }

    /// Mark the client destroyed: pending calls fail and new calls fail fast.
    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.fail_all(BridgeError::Destroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Age of the oldest call still waiting for a response.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.lock_pending()
            .values()
            .map(|call| call.created_at.elapsed())
            .max()
    }

    fn take(&self, id: &str) -> Option<PendingCall> {
        self.lock_pending().remove(id)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the call's entry when the awaiting future goes away, so cancelled
/// callers do not leak pending entries. A no-op once the call completed.
struct PendingGuard<'a> {
    client: &'a RpcClient,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.client.take(self.id).is_some() {
            tracing::debug!(id = self.id, "Abandoned bridge call removed");
        }
    }
}
