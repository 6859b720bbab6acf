//! Host-side glue between a native app and the embedded JS runtime.
//!
//! [`channel::ChannelTransport`] queues outbound calls for the host's UI
//! thread; the host pushes lifecycle signals and JS messages back through
//! its [`channel::HostEndpoint`]. [`bindings::HostBindings`] is the registry
//! of native methods JS can call.

pub mod bindings;
pub mod channel;

pub use bindings::{BindingError, HostBindings, HostValue, ValueKind};
pub use channel::{ChannelTransport, HostCall, HostEndpoint, channel_transport};
