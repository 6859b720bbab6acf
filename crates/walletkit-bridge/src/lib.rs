//! The WalletKit bridge engine.
//!
//! Wires the core pieces into a running engine per JS runtime:
//!
//! - [`dispatcher::MessageDispatcher`]: routes inbound messages, manages JS-side listeners
//! - [`init::InitManager`]: ready handshake and configure-once lifecycle
//! - [`durable::DurableEventStore`]: events kept until a handler has seen them
//! - [`engine::WalletKitEngine`]: the facade native callers use
//! - [`registry::EngineRegistry`]: one engine per network configuration

pub mod config;
pub mod dispatcher;
pub mod durable;
pub mod engine;
pub mod init;
mod inflight;
pub mod registry;

pub use config::{DurabilityPolicy, Network, WalletKitConfig};
pub use dispatcher::{MessageDispatcher, NetworkObserver, Routed};
pub use durable::{DurableEvent, DurableEventStore, DurableStatus, ReplayReport};
pub use engine::WalletKitEngine;
pub use init::{BridgeState, InitManager, NetworkConfigDerived};
pub use registry::{EngineRegistry, TransportFactory, TransportHandle};
