//! Gateway configuration – reads/writes `~/.topicbridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use topicbridge_runtime::{GatewayConfig, TopicDefinition};
use topicbridge_topics::{ConverterKind, RegistryConfig, TopicMatch};
use topicbridge_types::{MsgId, PluginId, Role};

/// One `[[topics]]` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub plugin_id: u8,
    pub converter: ConverterKind,
    /// Network name; the converter's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

/// Persisted gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// UDP port datagrams are received on (all interfaces).
    #[serde(default = "default_rx_port")]
    pub rx_port: u16,

    /// Destination host for outbound datagrams.
    #[serde(default = "default_tx_addr")]
    pub tx_addr: String,

    #[serde(default = "default_tx_port")]
    pub tx_port: u16,

    #[serde(default = "default_tx_pipe_name")]
    pub tx_pipe_name: String,

    #[serde(default = "default_tx_pipe_depth")]
    pub tx_pipe_depth: usize,

    /// Delay between receive-socket bind attempts.
    #[serde(default = "default_rx_retry_ms")]
    pub rx_retry_ms: u64,

    #[serde(default = "default_datagram_capacity")]
    pub datagram_capacity: usize,

    #[serde(default = "default_max_topic_name_len")]
    pub max_topic_name_len: usize,

    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,

    #[serde(default = "default_plugin_id_limit")]
    pub plugin_id_limit: usize,

    #[serde(default)]
    pub topic_match: TopicMatch,

    #[serde(default = "default_telemetry_base")]
    pub telemetry_base: u16,

    #[serde(default = "default_command_base")]
    pub command_base: u16,

    #[serde(default = "default_self_test_plugin")]
    pub self_test_plugin: u8,

    #[serde(default = "default_self_test_interval_ms")]
    pub self_test_interval_ms: u64,

    #[serde(default = "default_topics")]
    pub topics: Vec<TopicConfig>,
}

fn default_rx_port() -> u16 {
    8888
}
fn default_tx_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_tx_port() -> u16 {
    8889
}
fn default_tx_pipe_name() -> String {
    GatewayConfig::default().tx_pipe_name
}
fn default_tx_pipe_depth() -> usize {
    32
}
fn default_rx_retry_ms() -> u64 {
    2000
}
fn default_datagram_capacity() -> usize {
    topicbridge_runtime::DATAGRAM_CAPACITY
}
fn default_max_topic_name_len() -> usize {
    RegistryConfig::default().max_name_len
}
fn default_registry_capacity() -> usize {
    RegistryConfig::default().capacity
}
fn default_plugin_id_limit() -> usize {
    RegistryConfig::default().plugin_id_limit
}
fn default_telemetry_base() -> u16 {
    RegistryConfig::default().telemetry_base.value()
}
fn default_command_base() -> u16 {
    RegistryConfig::default().command_base.value()
}
fn default_self_test_plugin() -> u8 {
    2
}
fn default_self_test_interval_ms() -> u64 {
    2000
}
fn default_topics() -> Vec<TopicConfig> {
    topicbridge_runtime::default_topics()
        .into_iter()
        .map(|t| TopicConfig {
            plugin_id: t.plugin_id.0,
            converter: t.converter,
            name: t.name,
            role: t.role,
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rx_port: default_rx_port(),
            tx_addr: default_tx_addr(),
            tx_port: default_tx_port(),
            tx_pipe_name: default_tx_pipe_name(),
            tx_pipe_depth: default_tx_pipe_depth(),
            rx_retry_ms: default_rx_retry_ms(),
            datagram_capacity: default_datagram_capacity(),
            max_topic_name_len: default_max_topic_name_len(),
            registry_capacity: default_registry_capacity(),
            plugin_id_limit: default_plugin_id_limit(),
            topic_match: TopicMatch::default(),
            telemetry_base: default_telemetry_base(),
            command_base: default_command_base(),
            self_test_plugin: default_self_test_plugin(),
            self_test_interval_ms: default_self_test_interval_ms(),
            topics: default_topics(),
        }
    }
}

impl Config {
    /// Build the runtime configuration.
    ///
    /// Fails when `tx_addr` is not an IP address.
    pub fn to_gateway_config(&self) -> Result<GatewayConfig, String> {
        let tx_ip: IpAddr = self
            .tx_addr
            .parse()
            .map_err(|e| format!("Invalid tx_addr '{}': {}", self.tx_addr, e))?;

        Ok(GatewayConfig {
            rx_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.rx_port)),
            tx_addr: SocketAddr::new(tx_ip, self.tx_port),
            tx_source: None,
            tx_pipe_name: self.tx_pipe_name.clone(),
            tx_pipe_depth: self.tx_pipe_depth,
            rx_retry_interval: Duration::from_millis(self.rx_retry_ms),
            datagram_capacity: self.datagram_capacity,
            registry: RegistryConfig {
                plugin_id_limit: self.plugin_id_limit,
                capacity: self.registry_capacity,
                max_name_len: self.max_topic_name_len,
                telemetry_base: MsgId::new(self.telemetry_base),
                command_base: MsgId::new(self.command_base),
                topic_match: self.topic_match,
            },
            topics: self
                .topics
                .iter()
                .map(|t| TopicDefinition {
                    plugin_id: PluginId(t.plugin_id),
                    converter: t.converter,
                    name: t.name.clone(),
                    role: t.role,
                })
                .collect(),
            self_test_plugin: PluginId(self.self_test_plugin),
            self_test_interval: Duration::from_millis(self.self_test_interval_ms),
        })
    }
}

/// Return the path to `~/.topicbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".topicbridge").join("config.toml")
}

/// Load the config from disk with environment overrides applied.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    Ok(load_from(&config_path())?.map(|mut cfg| {
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `TOPICBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TOPICBRIDGE_RX_PORT` | `rx_port` |
/// | `TOPICBRIDGE_TX_ADDR` | `tx_addr` |
/// | `TOPICBRIDGE_TX_PORT` | `tx_port` |
///
/// Unparseable port values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TOPICBRIDGE_RX_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.rx_port = port;
    }
    if let Ok(v) = std::env::var("TOPICBRIDGE_TX_ADDR") {
        cfg.tx_addr = v;
    }
    if let Ok(v) = std::env::var("TOPICBRIDGE_TX_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.tx_port = port;
    }
}

/// Save the config to disk, creating `~/.topicbridge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
