use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use walletkit_core::event::NetworkChanged;
use walletkit_core::{BridgeError, HostSignal, RpcClient};

use crate::config::{Network, WalletKitConfig};
use crate::dispatcher::NetworkObserver;
use crate::inflight::{self, Outcome};

/// JS method that applies the configuration.
pub const INIT_METHOD: &str = "init";

/// Lifecycle of one engine's JS runtime.
///
/// `NotLoaded → Loading → Loaded → Ready` only moves forward; `Destroyed` is
/// reachable from anywhere and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    NotLoaded,
    Loading,
    Loaded,
    Ready,
    Destroyed,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotLoaded => "not_loaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Ready => "ready",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Network settings in effect, refreshed after init and on network changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigDerived {
    pub network: Network,
    pub api_base_url: String,
    pub persistent_storage_enabled: bool,
    pub api_key: Option<String>,
}

impl NetworkConfigDerived {
    fn from_config(config: &WalletKitConfig) -> Self {
        Self {
            network: config.network,
            api_base_url: config.effective_api_base_url(),
            persistent_storage_enabled: config.persistent_storage_enabled(),
            api_key: config.api_key(),
        }
    }
}

/// Where the configure-once step stands. Only touched under short,
/// synchronous locks; the init call itself runs unlocked.
enum InitSlot {
    Idle,
    InFlight {
        config: WalletKitConfig,
        outcome: watch::Receiver<Outcome>,
    },
    Applied(WalletKitConfig),
}

/// Puts the slot back to `Idle` if the initializing task is cancelled, so
/// the callers that joined it can take over.
struct InitAttempt<'a> {
    slot: &'a StdMutex<InitSlot>,
    armed: bool,
}

impl Drop for InitAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = InitSlot::Idle;
        }
    }
}

/// Drives the ready handshake and the configure-once state machine.
///
/// `initialize` runs at most once successfully; concurrent callers join the
/// attempt in flight and observe its result. The manager never times
/// out on its own: callers bound waits with
/// [`ensure_initialized_within`](Self::ensure_initialized_within).
pub struct InitManager {
    rpc: Arc<RpcClient>,
    state: watch::Sender<BridgeState>,
    load_error: StdMutex<Option<String>>,
    slot: StdMutex<InitSlot>,
    initialized: AtomicBool,
    default_config: WalletKitConfig,
    network: RwLock<Option<NetworkConfigDerived>>,
    poll_initial: Duration,
    poll_max: Duration,
}

impl InitManager {
    pub fn new(rpc: Arc<RpcClient>, default_config: WalletKitConfig) -> Self {
        let (state, _) = watch::channel(BridgeState::NotLoaded);
        let poll_initial = Duration::from_millis(default_config.bridge.ready_poll_initial_ms);
        let poll_max = Duration::from_millis(default_config.bridge.ready_poll_max_ms);
        Self {
            rpc,
            state,
            load_error: StdMutex::new(None),
            slot: StdMutex::new(InitSlot::Idle),
            initialized: AtomicBool::new(false),
            default_config,
            network: RwLock::new(None),
            poll_initial,
            poll_max,
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == BridgeState::Destroyed
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether an initialization is waiting for readiness or the JS side.
    pub fn is_initializing(&self) -> bool {
        matches!(*self.slot(), InitSlot::InFlight { .. })
    }

    fn slot(&self) -> MutexGuard<'_, InitSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load_error(&self) -> Option<String> {
        self.load_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn network_state(&self) -> Option<NetworkConfigDerived> {
        self.network
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a lifecycle signal from the host runtime.
    pub fn on_signal(&self, signal: HostSignal) {
        match signal {
            HostSignal::Loading => self.transition(BridgeState::Loading),
            HostSignal::Loaded => self.transition(BridgeState::Loaded),
            HostSignal::Ready => self.transition(BridgeState::Ready),
            HostSignal::LoadFailed(reason) => self.load_failed(reason),
            HostSignal::Message(_) => {
                tracing::debug!("Ignoring message routed to the init manager");
            }
        }
    }

    fn transition(&self, next: BridgeState) {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if *state == BridgeState::Destroyed || next <= *state {
                return false;
            }
            from = Some(*state);
            *state = next;
            true
        });
        match from {
            Some(from) => tracing::info!(%from, to = %next, "Bridge state changed"),
            None => tracing::debug!(current = %self.state(), ignored = %next, "Ignoring stale state signal"),
        }
    }

    fn load_failed(&self, reason: String) {
        {
            let mut load_error = self.load_error.lock().unwrap_or_else(PoisonError::into_inner);
            if load_error.is_some() || self.is_destroyed() {
                return;
            }
            *load_error = Some(reason.clone());
        }
        // Wake readiness waiters so they observe the failure.
        self.state.send_modify(|_| {});
        let failed = self.rpc.fail_all(BridgeError::TransportLoad(reason.clone()));
        tracing::error!(reason, failed, "JS runtime failed to load");
    }

    /// Configure the bridge. A repeat call with the same configuration is a
    /// no-op; a different one is rejected.
    pub async fn initialize(&self, config: WalletKitConfig) -> Result<(), BridgeError> {
        self.initialize_with(config, true).await
    }

    /// Initialize with the default configuration unless already done. Waits
    /// for an in-flight initialization instead of starting another.
    pub async fn ensure_initialized(&self) -> Result<(), BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::Destroyed);
        }
        if self.is_initialized() {
            return Ok(());
        }
        self.initialize_with(self.default_config.clone(), false)
            .await
    }

    pub async fn ensure_initialized_within(&self, timeout: Duration) -> Result<(), BridgeError> {
        match tokio::time::timeout(timeout, self.ensure_initialized()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::NotReady(format!(
                "initialization did not complete within {}ms (state: {})",
                timeout.as_millis(),
                self.state()
            ))),
        }
    }

    async fn initialize_with(
        &self,
        config: WalletKitConfig,
        explicit: bool,
    ) -> Result<(), BridgeError> {
        config.validate()?;
        if self.is_destroyed() {
            return Err(BridgeError::Destroyed);
        }

        loop {
            let lead = {
                let mut slot = self.slot();
                match &*slot {
                    InitSlot::Applied(current) => {
                        return if !explicit || *current == config {
                            Ok(())
                        } else {
                            Err(BridgeError::AlreadyInitialized)
                        };
                    }
                    InitSlot::InFlight { outcome, .. } => Err(outcome.clone()),
                    InitSlot::Idle => {
                        let (tx, rx) = inflight::channel();
                        *slot = InitSlot::InFlight {
                            config: config.clone(),
                            outcome: rx,
                        };
                        Ok(tx)
                    }
                }
            };
            let tx = match lead {
                Ok(tx) => tx,
                // Failures are shared; on success the next pass compares configs.
                Err(outcome) => match inflight::join(outcome).await {
                    Some(Err(e)) => return Err(e),
                    _ => continue,
                },
            };

            let mut attempt = InitAttempt {
                slot: &self.slot,
                armed: true,
            };
            tracing::info!(network = %config.network, explicit, "Initializing bridge");
            let result = self.run_init(&config).await;
            attempt.armed = false;

            if result.is_ok() {
                self.set_network(NetworkConfigDerived::from_config(&config));
                self.initialized.store(true, Ordering::SeqCst);
                *self.slot() = InitSlot::Applied(config);
                tracing::info!("Bridge initialized");
            } else {
                *self.slot() = InitSlot::Idle;
            }
            tx.send_replace(Some(result.clone()));
            return result;
        }
    }

    async fn run_init(&self, config: &WalletKitConfig) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        self.rpc.call(INIT_METHOD, Some(config.init_params())).await?;
        Ok(())
    }

    /// Wait until the JS bridge is ready, polling the transport between
    /// state changes with exponential backoff.
    pub async fn wait_ready(&self) -> Result<(), BridgeError> {
        let mut changes = self.state.subscribe();
        let mut delay = self.poll_initial;
        loop {
            let state = *changes.borrow_and_update();
            if state == BridgeState::Destroyed {
                return Err(BridgeError::Destroyed);
            }
            if let Some(reason) = self.load_error() {
                return Err(BridgeError::TransportLoad(reason));
            }
            if state == BridgeState::Ready {
                return Ok(());
            }

            if self.rpc.transport().probe_ready().await {
                self.transition(BridgeState::Ready);
                continue;
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(BridgeError::Destroyed);
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(self.poll_max);
                }
            }
        }
    }

    /// Tear down for good: fail pending calls and release the transport.
    /// Returns `false` if already destroyed.
    pub fn destroy(&self) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == BridgeState::Destroyed {
                return false;
            }
            *state = BridgeState::Destroyed;
            true
        });
        if !first {
            tracing::debug!("Bridge already destroyed");
            return false;
        }

        self.rpc.mark_destroyed();
        let failed = self.rpc.fail_all(BridgeError::Destroyed);
        self.rpc.transport().release();
        tracing::info!(failed, transport = self.rpc.transport().name(), "Bridge destroyed");
        true
    }

    fn set_network(&self, derived: NetworkConfigDerived) {
        tracing::info!(network = %derived.network, api_base_url = %derived.api_base_url, "Network state refreshed");
        *self.network.write().unwrap_or_else(PoisonError::into_inner) = Some(derived);
    }
}

impl NetworkObserver for InitManager {
    fn network_changed(&self, change: &NetworkChanged) {
        let Some(network) = Network::parse(&change.network) else {
            tracing::warn!(network = %change.network, "Ignoring change to unknown network");
            return;
        };
        let current = self.network_state();
        let api_base_url = change
            .api_base_url
            .clone()
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| network.default_api_base_url().to_string());
        self.set_network(NetworkConfigDerived {
            network,
            api_base_url,
            persistent_storage_enabled: current
                .as_ref()
                .is_some_and(|c| c.persistent_storage_enabled),
            api_key: current.and_then(|c| c.api_key),
        });
    }
}
