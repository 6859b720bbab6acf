use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use walletkit_core::envelope::{EVENT_KIND, RESPONSE_KIND};
use walletkit_core::{BridgeError, CallEnvelope, HostSignal, Transport};

use crate::bindings::{BindingError, HostBindings, HostValue, ValueKind};

/// JS entry point the host evaluates for every call.
pub const CALL_ENTRY_POINT: &str = "window.walletkit.handleCall";

/// Global object under which native callbacks are exposed to JS.
pub const NATIVE_OBJECT: &str = "WalletKitNative";

/// A call handed to the host, to be evaluated on its UI thread.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    pub envelope: CallEnvelope,
    /// `window.walletkit.handleCall(<envelope json>)`
    pub script: String,
}

/// [`Transport`] that queues calls for the host instead of evaluating them.
///
/// The host owns the matching [`HostEndpoint`]: it drains calls on its UI
/// thread and pushes lifecycle signals and raw JS messages back. Sending is
/// therefore safe from any task.
pub struct ChannelTransport {
    name: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<HostCall>>>,
    ready: Arc<AtomicBool>,
    released: AtomicBool,
}

/// Host side of a [`ChannelTransport`].
pub struct HostEndpoint {
    calls: mpsc::UnboundedReceiver<HostCall>,
    signals: mpsc::UnboundedSender<HostSignal>,
    ready: Arc<AtomicBool>,
}

/// Create a connected transport / host endpoint pair plus the inbound signal
/// stream consumed by the engine.
pub fn channel_transport(
    name: impl Into<String>,
) -> (ChannelTransport, HostEndpoint, mpsc::UnboundedReceiver<HostSignal>) {
    let (call_tx, call_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let ready = Arc::new(AtomicBool::new(false));

    let transport = ChannelTransport {
        name: name.into(),
        outbound: Mutex::new(Some(call_tx)),
        ready: ready.clone(),
        released: AtomicBool::new(false),
    };
    let endpoint = HostEndpoint {
        calls: call_rx,
        signals: signal_tx,
        ready,
    };
    (transport, endpoint, signal_rx)
}

/// Render the script that delivers `envelope` to the JS bridge.
pub fn call_script(envelope: &CallEnvelope) -> Result<String, BridgeError> {
    let encoded = serde_json::to_string(envelope)?;
    // U+2028/U+2029 are valid in JSON strings but terminate lines in older JS engines.
    let encoded = encoded.replace('\u{2028}', "\\u2028").replace('\u{2029}', "\\u2029");
    Ok(format!("{CALL_ENTRY_POINT}({encoded})"))
}

impl ChannelTransport {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Transport for ChannelTransport {
    fn send<'a>(
        &'a self,
        call: &'a CallEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'a>> {
        Box::pin(async move {
            if self.is_released() {
                return Err(BridgeError::Destroyed);
            }
            let host_call = HostCall {
                envelope: call.clone(),
                script: call_script(call)?,
            };

            let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = outbound.as_ref() else {
                return Err(BridgeError::Destroyed);
            };
            sender.send(host_call).map_err(|_| {
                BridgeError::Transport(format!("host runtime {} stopped accepting calls", self.name))
            })
        })
    }

    fn probe_ready<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move { !self.is_released() && self.ready.load(Ordering::SeqCst) })
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.ready.store(false, Ordering::SeqCst);
        tracing::info!(transport = %self.name, "Host runtime released");
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl HostEndpoint {
    /// Next call to evaluate; `None` once the transport is released.
    pub async fn next_call(&mut self) -> Option<HostCall> {
        self.calls.recv().await
    }

    pub fn try_next_call(&mut self) -> Option<HostCall> {
        self.calls.try_recv().ok()
    }

    /// Push a lifecycle signal or message. `Ready` also flips the probe flag.
    ///
    /// Returns `false` when the engine is no longer listening.
    pub fn signal(&self, signal: HostSignal) -> bool {
        if signal == HostSignal::Ready {
            self.ready.store(true, Ordering::SeqCst);
        }
        self.signals.send(signal).is_ok()
    }

    /// Mark the JS bridge as ready for probing without emitting a signal,
    /// as when the page loaded but its ready callback was missed.
    pub fn set_probe_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn post_message(&self, raw: impl Into<String>) -> bool {
        self.signal(HostSignal::Message(raw.into()))
    }

    pub fn respond(&self, id: &str, result: Value) -> bool {
        self.post_message(json!({ "kind": RESPONSE_KIND, "id": id, "result": result }).to_string())
    }

    pub fn respond_error(&self, id: &str, message: &str) -> bool {
        self.post_message(
            json!({ "kind": RESPONSE_KIND, "id": id, "error": { "message": message } }).to_string(),
        )
    }

    pub fn emit_event(&self, event_type: &str, id: Option<&str>, payload: Value) -> bool {
        let mut message = json!({ "kind": EVENT_KIND, "type": event_type, "payload": payload });
        if let Some(id) = id {
            message["id"] = Value::String(id.to_string());
        }
        self.post_message(message.to_string())
    }

    /// Bindings for the `WalletKitNative` object the JS bundle calls into:
    /// `postMessage(String)`, `signalReady()`, `signalLoadFailed(String)`.
    pub fn native_bindings(&self) -> Result<HostBindings, BindingError> {
        let bindings = HostBindings::new();

        let signals = self.signals.clone();
        bindings.register(
            NATIVE_OBJECT,
            "postMessage",
            &[ValueKind::String],
            ValueKind::Void,
            move |args: &[HostValue]| {
                let raw = args
                    .first()
                    .and_then(HostValue::as_str)
                    .ok_or_else(|| "postMessage requires a message".to_string())?;
                signals
                    .send(HostSignal::Message(raw.to_string()))
                    .map_err(|_| "bridge is no longer listening".to_string())?;
                Ok(HostValue::Void)
            },
        )?;

        let signals = self.signals.clone();
        let ready = self.ready.clone();
        bindings.register(
            NATIVE_OBJECT,
            "signalReady",
            &[],
            ValueKind::Void,
            move |_: &[HostValue]| {
                ready.store(true, Ordering::SeqCst);
                signals
                    .send(HostSignal::Ready)
                    .map_err(|_| "bridge is no longer listening".to_string())?;
                Ok(HostValue::Void)
            },
        )?;

        let signals = self.signals.clone();
        bindings.register(
            NATIVE_OBJECT,
            "signalLoadFailed",
            &[ValueKind::String],
            ValueKind::Void,
            move |args: &[HostValue]| {
                let reason = args
                    .first()
                    .and_then(HostValue::as_str)
                    .unwrap_or("unknown load failure")
                    .to_string();
                signals
                    .send(HostSignal::LoadFailed(reason))
                    .map_err(|_| "bridge is no longer listening".to_string())?;
                Ok(HostValue::Void)
            },
        )?;

        Ok(bindings)
    }
}
