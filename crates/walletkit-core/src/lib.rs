//! Core of the WalletKit bridge.
//!
//! A native wallet app embeds the JS wallet engine in a host runtime
//! (WebView or equivalent) and talks to it over JSON messages. This crate
//! holds the pieces that do not depend on how that runtime is hosted:
//!
//! - [`envelope`]: call/response/event wire envelopes and inbound classification
//! - [`event`]: the closed, typed event model
//! - [`rpc::RpcClient`]: call ids, pending-call tracking, at-most-once completion
//! - [`router::EventRouter`]: handler registration and isolated fan-out
//! - [`transport::Transport`]: the capability used to reach the JS runtime

pub mod envelope;
pub mod error;
pub mod event;
pub mod router;
pub mod rpc;
pub mod transport;

pub use envelope::{CallEnvelope, EventEnvelope, InboundMessage, ResponseEnvelope};
pub use error::BridgeError;
pub use event::{Event, EventKind, EventType, ParsedEvent};
pub use router::{DispatchReport, EventHandler, EventRouter, FnHandler};
pub use rpc::RpcClient;
pub use transport::{HostSignal, Transport};
