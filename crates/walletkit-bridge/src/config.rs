use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use walletkit_core::{BridgeError, EventType};
use walletkit_storage::{FileStorage, KeyValueStorage, MemoryStorage};

/// Environment variable overriding `api_key`.
pub const API_KEY_ENV: &str = "WALLETKIT_API_KEY";

const MAINNET_API_BASE_URL: &str = "https://toncenter.com";
const TESTNET_API_BASE_URL: &str = "https://testnet.toncenter.com";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WalletKitConfig {
    #[serde(default)]
    pub network: Network,
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mainnet" | "-239" => Some(Self::Mainnet),
            "testnet" | "-3" => Some(Self::Testnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    pub fn default_api_base_url(&self) -> &'static str {
        match self {
            Self::Mainnet => MAINNET_API_BASE_URL,
            Self::Testnet => TESTNET_API_BASE_URL,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory for the file backend; defaults to ~/.walletkit/storage.
    pub path: Option<PathBuf>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: None,
            persistent: default_persistent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_ready_poll_initial_ms")]
    pub ready_poll_initial_ms: u64,
    #[serde(default = "default_ready_poll_max_ms")]
    pub ready_poll_max_ms: u64,
    #[serde(default)]
    pub durability: DurabilityPolicy,
    /// Delivered durable events kept for inspection; older ones are pruned.
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
}

fn default_ready_poll_initial_ms() -> u64 {
    50
}
fn default_ready_poll_max_ms() -> u64 {
    2000
}
fn default_completed_retention() -> usize {
    crate::durable::DEFAULT_COMPLETED_RETENTION
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ready_poll_initial_ms: default_ready_poll_initial_ms(),
            ready_poll_max_ms: default_ready_poll_max_ms(),
            durability: DurabilityPolicy::default(),
            completed_retention: default_completed_retention(),
        }
    }
}

/// When an inbound event is written to the durable store before dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityPolicy {
    /// Only when no handler is registered at arrival.
    #[default]
    NoHandlers,
    /// Every event.
    Always,
    /// Connect requests always, everything else only with no handlers.
    ConnectRequests,
}

impl DurabilityPolicy {
    pub fn should_persist(&self, event_type: EventType, has_handlers: bool) -> bool {
        match self {
            Self::NoHandlers => !has_handlers,
            Self::Always => true,
            Self::ConnectRequests => event_type == EventType::ConnectRequest || !has_handlers,
        }
    }
}

impl WalletKitConfig {
    pub fn from_file(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, BridgeError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if let Some(url) = &self.api_base_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(BridgeError::Config(format!(
                    "api_base_url must be an http(s) URL, got {url:?}"
                )));
            }
        }
        if self.bridge.ready_poll_initial_ms == 0 {
            return Err(BridgeError::Config(
                "bridge.ready_poll_initial_ms must be greater than zero".into(),
            ));
        }
        if self.bridge.ready_poll_initial_ms > self.bridge.ready_poll_max_ms {
            return Err(BridgeError::Config(
                "bridge.ready_poll_initial_ms must not exceed bridge.ready_poll_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// `api_key`, unless overridden from the environment.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn effective_api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| self.network.default_api_base_url().to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// One engine exists per key.
    pub fn engine_key(&self) -> String {
        format!("{}@{}", self.network, self.effective_api_base_url())
    }

    pub fn persistent_storage_enabled(&self) -> bool {
        self.storage.persistent && self.storage.backend == StorageBackend::File
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(FileStorage::default_path)
    }

    pub fn build_storage(&self) -> Arc<dyn KeyValueStorage> {
        match self.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::File => Arc::new(FileStorage::new(self.storage_path())),
        }
    }

    /// Parameters of the JS-side `init` call.
    pub fn init_params(&self) -> Value {
        json!({
            "network": self.network.as_str(),
            "apiKey": self.api_key(),
            "apiBaseUrl": self.effective_api_base_url(),
            "persistentStorage": self.persistent_storage_enabled(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = WalletKitConfig::from_toml_str("").unwrap();
        assert_eq!(config, WalletKitConfig::default());
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.bridge.ready_poll_initial_ms, 50);
        assert_eq!(config.bridge.durability, DurabilityPolicy::NoHandlers);
        assert_eq!(config.bridge.completed_retention, 32);
        assert!(!config.persistent_storage_enabled());
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
network = "testnet"
api_key = "tc-test"
api_base_url = "https://testnet.example.org/"

[storage]
backend = "file"
path = "/var/lib/walletkit"

[bridge]
ready_poll_initial_ms = 10
ready_poll_max_ms = 500
durability = "connect_requests"
completed_retention = 5
"#;
        let config = WalletKitConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.api_key.as_deref(), Some("tc-test"));
        assert_eq!(config.effective_api_base_url(), "https://testnet.example.org");
        assert_eq!(config.engine_key(), "testnet@https://testnet.example.org");
        assert_eq!(config.storage_path(), PathBuf::from("/var/lib/walletkit"));
        assert!(config.persistent_storage_enabled());
        assert_eq!(config.bridge.durability, DurabilityPolicy::ConnectRequests);
        assert_eq!(config.bridge.completed_retention, 5);
    }

    #[test]
    fn engine_key_falls_back_to_network_default() {
        assert_eq!(
            WalletKitConfig::for_network(Network::Mainnet).engine_key(),
            "mainnet@https://toncenter.com"
        );
        assert_ne!(
            WalletKitConfig::for_network(Network::Mainnet).engine_key(),
            WalletKitConfig::for_network(Network::Testnet).engine_key()
        );
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            WalletKitConfig::from_toml_str(r#"network = "devnet""#),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            WalletKitConfig::from_toml_str(r#"api_base_url = "ftp://x""#),
            Err(BridgeError::Config(_))
        ));
        let toml_str = r#"
[bridge]
ready_poll_initial_ms = 100
ready_poll_max_ms = 10
"#;
        assert!(WalletKitConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn durability_policies() {
        use EventType::*;
        assert!(DurabilityPolicy::NoHandlers.should_persist(Disconnect, false));
        assert!(!DurabilityPolicy::NoHandlers.should_persist(ConnectRequest, true));
        assert!(DurabilityPolicy::Always.should_persist(Disconnect, true));
        assert!(DurabilityPolicy::ConnectRequests.should_persist(ConnectRequest, true));
        assert!(!DurabilityPolicy::ConnectRequests.should_persist(Disconnect, true));
    }

    #[test]
    fn network_parses_names_and_chain_ids() {
        assert_eq!(Network::parse("TESTNET"), Some(Network::Testnet));
        assert_eq!(Network::parse("-239"), Some(Network::Mainnet));
        assert_eq!(Network::parse("devnet"), None);
    }

    #[test]
    fn init_params_carry_effective_values() {
        let config = WalletKitConfig::for_network(Network::Testnet);
        let params = config.init_params();
        assert_eq!(params["network"], "testnet");
        assert_eq!(params["apiBaseUrl"], "https://testnet.toncenter.com");
        assert_eq!(params["persistentStorage"], false);
    }
}
