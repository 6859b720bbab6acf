use std::future::Future;
use std::pin::Pin;

use crate::envelope::CallEnvelope;
use crate::error::BridgeError;

/// Capability to send calls into the embedded JS runtime.
///
/// Implementations must marshal every call onto the host's UI thread; callers
/// may invoke `send` from any task. Responses are not returned here: they
/// arrive later on the inbound [`HostSignal`] stream.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility.
pub trait Transport: Send + Sync {
    /// Hand one call envelope to the JS runtime.
    ///
    /// An `Err` here is scoped to this call only (for example a synchronous
    /// evaluation error).
    fn send<'a>(
        &'a self,
        call: &'a CallEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'a>>;

    /// Ask the runtime whether its JS bridge has finished loading.
    fn probe_ready<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Release the underlying runtime. Must be idempotent.
    fn release(&self);

    /// Transport name for logging.
    fn name(&self) -> &str;
}

/// Lifecycle signals and messages pushed from the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSignal {
    /// The host started loading the JS bundle.
    Loading,
    /// The bundle is loaded; the JS bridge is not necessarily ready yet.
    Loaded,
    /// The JS bridge signalled it accepts calls.
    Ready,
    /// Loading failed; fatal for this runtime instance.
    LoadFailed(String),
    /// A raw JSON message (response or event) from the JS side.
    Message(String),
}
