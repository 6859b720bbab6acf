use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use walletkit_core::{BridgeError, EventHandler, EventRouter, HostSignal, RpcClient, Transport};
use walletkit_storage::{KeyValueStorage, MemoryStorage};

use crate::config::WalletKitConfig;
use crate::dispatcher::{MessageDispatcher, NetworkObserver};
use crate::durable::DurableEventStore;
use crate::init::{BridgeState, InitManager, NetworkConfigDerived};

/// One embedded JS runtime and everything bound to it.
///
/// Created with [`start`](Self::start), which spawns two tasks: a pump that
/// drains the host signal stream (lifecycle signals to the init manager,
/// messages to the dispatcher) and the dispatcher's ordered event lane.
/// Both are aborted on [`destroy`](Self::destroy) or drop.
pub struct WalletKitEngine {
    instance_id: Uuid,
    config: WalletKitConfig,
    rpc: Arc<RpcClient>,
    init: Arc<InitManager>,
    dispatcher: Arc<MessageDispatcher>,
    durable: Arc<DurableEventStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WalletKitEngine {
    /// Wire up an engine over `transport`. Must be called inside a tokio
    /// runtime.
    ///
    /// Without a storage adapter, durable events are kept in memory only.
    pub fn start(
        transport: Arc<dyn Transport>,
        signals: mpsc::UnboundedReceiver<HostSignal>,
        storage: Option<Arc<dyn KeyValueStorage>>,
        config: WalletKitConfig,
    ) -> Arc<Self> {
        let instance_id = Uuid::new_v4();
        let storage = storage.unwrap_or_else(|| {
            tracing::warn!(%instance_id, "No storage adapter configured, durable events will not survive a restart");
            Arc::new(MemoryStorage::new()) as Arc<dyn KeyValueStorage>
        });

        let rpc = Arc::new(RpcClient::new(transport));
        let init = Arc::new(InitManager::new(rpc.clone(), config.clone()));
        let durable = Arc::new(
            DurableEventStore::namespaced(storage, &config.engine_key())
                .with_retention(config.bridge.completed_retention),
        );
        let (dispatcher, lane) = MessageDispatcher::new(
            rpc.clone(),
            Arc::new(EventRouter::new()),
            durable.clone(),
            config.bridge.durability,
            Some(init.clone() as Arc<dyn NetworkObserver>),
        );
        let dispatcher = Arc::new(dispatcher);

        let pump = tokio::spawn(pump_signals(signals, init.clone(), dispatcher.clone()));
        let events = tokio::spawn(dispatcher.clone().run_event_lane(lane));

        tracing::info!(
            %instance_id,
            engine_key = %config.engine_key(),
            transport = rpc.transport().name(),
            "WalletKit engine started"
        );

        Arc::new(Self {
            instance_id,
            config,
            rpc,
            init,
            dispatcher,
            durable,
            tasks: Mutex::new(vec![pump, events]),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &WalletKitConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        self.init.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.init.is_destroyed()
    }

    pub fn network_state(&self) -> Option<NetworkConfigDerived> {
        self.init.network_state()
    }

    /// Calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.rpc.pending_count()
    }

    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.rpc.oldest_pending_age()
    }

    pub fn durable_events(&self) -> &DurableEventStore {
        &self.durable
    }

    pub fn init_manager(&self) -> &InitManager {
        &self.init
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Apply `config` explicitly. See [`InitManager::initialize`].
    ///
    /// The engine's durable store and registry entry are keyed by network
    /// and API base URL, so a config naming a different pair is rejected.
    pub async fn init(&self, config: WalletKitConfig) -> Result<(), BridgeError> {
        let (requested, started) = (config.engine_key(), self.config.engine_key());
        if requested != started {
            return Err(BridgeError::Config(format!(
                "engine {started} cannot be initialized for {requested}"
            )));
        }
        self.init.initialize(config).await
    }

    pub async fn ensure_initialized(&self) -> Result<(), BridgeError> {
        self.init.ensure_initialized().await
    }

    pub async fn add_events_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), BridgeError> {
        self.init.ensure_initialized().await?;
        self.dispatcher.add_handler(handler).await;
        Ok(())
    }

    pub async fn remove_events_handler(&self, handler: &Arc<dyn EventHandler>) -> Result<(), BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::Destroyed);
        }
        self.dispatcher.remove_handler(handler).await;
        Ok(())
    }

    /// Call a JS bridge method, initializing with defaults first if needed.
    pub async fn call_bridge_method(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        self.init.ensure_initialized().await?;
        self.rpc.call(method, params).await
    }

    /// [`call_bridge_method`](Self::call_bridge_method) bounded by `timeout`.
    /// On elapse the pending call is removed and `NotReady` is returned.
    pub async fn call_bridge_method_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        match tokio::time::timeout(timeout, self.call_bridge_method(method, params)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(method, timeout_ms = timeout.as_millis() as u64, "Bridge call timed out");
                Err(BridgeError::NotReady(format!(
                    "{method} did not complete within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Destroy the engine. Idempotent; returns `false` on repeat calls.
    pub fn destroy(&self) -> bool {
        let first = self.init.destroy();
        self.dispatcher.reset_listeners();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if first {
            tracing::info!(instance_id = %self.instance_id, "WalletKit engine destroyed");
        }
        first
    }
}

impl Drop for WalletKitEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn pump_signals(
    mut signals: mpsc::UnboundedReceiver<HostSignal>,
    init: Arc<InitManager>,
    dispatcher: Arc<MessageDispatcher>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            HostSignal::Message(raw) => {
                dispatcher.handle_message(&raw);
            }
            lifecycle => init.on_signal(lifecycle),
        }
    }
    tracing::debug!("Host signal stream closed");
}
