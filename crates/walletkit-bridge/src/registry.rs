use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use walletkit_core::{BridgeError, HostSignal, Transport};
use walletkit_storage::KeyValueStorage;

use crate::config::WalletKitConfig;
use crate::engine::WalletKitEngine;

/// A freshly started JS runtime: the outbound transport and its inbound
/// signal stream.
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub signals: mpsc::UnboundedReceiver<HostSignal>,
}

/// Starts a JS runtime for a configuration. Provided by the host app.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility.
pub trait TransportFactory: Send + Sync {
    fn create<'a>(
        &'a self,
        config: &'a WalletKitConfig,
    ) -> Pin<Box<dyn Future<Output = Result<TransportHandle, BridgeError>> + Send + 'a>>;
}

/// One engine per configuration key, created on first use.
///
/// Creation runs under the registry lock, so concurrent first use of a key
/// starts exactly one runtime.
pub struct EngineRegistry {
    factory: Arc<dyn TransportFactory>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    engines: Mutex<HashMap<String, Arc<WalletKitEngine>>>,
}

impl EngineRegistry {
    /// With `storage` set every engine shares it (namespaced per key);
    /// otherwise each engine builds the backend its configuration names.
    pub fn new(factory: Arc<dyn TransportFactory>, storage: Option<Arc<dyn KeyValueStorage>>) -> Self {
        Self {
            factory,
            storage,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(
        &self,
        config: &WalletKitConfig,
    ) -> Result<Arc<WalletKitEngine>, BridgeError> {
        config.validate()?;
        let key = config.engine_key();
        let mut engines = self.engines.lock().await;

        if let Some(engine) = engines.get(&key) {
            if !engine.is_destroyed() {
                return Ok(engine.clone());
            }
            tracing::debug!(key, "Replacing destroyed engine");
            engines.remove(&key);
        }

        let handle = self.factory.create(config).await?;
        let storage = self
            .storage
            .clone()
            .unwrap_or_else(|| config.build_storage());
        let engine = WalletKitEngine::start(handle.transport, handle.signals, Some(storage), config.clone());
        engines.insert(key.clone(), engine.clone());
        tracing::info!(key, "Engine registered");
        Ok(engine)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<WalletKitEngine>> {
        self.engines.lock().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.engines.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.engines.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.lock().await.is_empty()
    }

    /// Destroy and evict the engine for `key`.
    pub async fn destroy(&self, key: &str) -> bool {
        let Some(engine) = self.engines.lock().await.remove(key) else {
            return false;
        };
        engine.destroy();
        true
    }

    /// Destroy every engine. Returns how many were torn down.
    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<Arc<WalletKitEngine>> =
            self.engines.lock().await.drain().map(|(_, e)| e).collect();
        for engine in &drained {
            engine.destroy();
        }
        tracing::info!(count = drained.len(), "All engines destroyed");
        drained.len()
    }
}
