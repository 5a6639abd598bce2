//! Server configuration and relay-state persistence.
//!
//! Two TOML files: the server settings (loaded once, CLI overrides applied)
//! and the relay state (message types, client bindings, channel
//! restrictions) which is rewritten after every mutating operator command.
//! Derived message-type fields are never stored — they are recomputed on
//! load so a hand-edited file cannot smuggle stale derivations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use chatbridge_core::{BridgeError, BridgeResult, RoutingTable, TypeRegistry};

/// Top-level server settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the settings TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_state_path")]
    pub state: String,
    #[serde(default = "default_surface_name")]
    pub surface_name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            state: default_state_path(),
            surface_name: default_surface_name(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4460
}
fn default_state_path() -> String {
    "~/.chatbridge/relay.toml".to_string()
}
fn default_surface_name() -> String {
    "Chat".to_string()
}
fn default_true() -> bool {
    true
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Relay state file (types, routing, restrictions).
    pub state_path: PathBuf,
    /// Client label used when encoding surface-originated messages.
    pub surface_name: String,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_state: Option<&str>,
    ) -> BridgeResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let bind = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.bind);
        let port = cli_port.unwrap_or(file_config.server.port);
        let state = cli_state
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.state);

        Ok(Self {
            bind,
            port,
            state_path: expand_tilde_str(&state),
            surface_name: file_config.server.surface_name,
        })
    }
}

/// Persisted shape of one message type. Derived fields are intentionally
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeEntry {
    pub format: String,
    #[serde(default = "default_true")]
    pub sendable: bool,
}

/// Persisted shape of one channel restriction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictionEntry {
    #[serde(rename = "type")]
    pub type_prefix: String,
    #[serde(default)]
    pub consume: bool,
}

/// On-disk relay state: the three persisted tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayStateFile {
    /// Message types keyed by prefix.
    #[serde(default)]
    pub types: BTreeMap<String, TypeEntry>,
    /// Client → channel bindings.
    #[serde(default)]
    pub routing: BTreeMap<String, String>,
    /// Channel → type restrictions.
    #[serde(default)]
    pub restricted: BTreeMap<String, RestrictionEntry>,
}

impl RelayStateFile {
    /// Snapshot live state for saving.
    pub fn from_state(registry: &TypeRegistry, routing: &RoutingTable) -> Self {
        let mut file = Self::default();
        for ty in registry.iter() {
            file.types.insert(
                ty.prefix.clone(),
                TypeEntry {
                    format: ty.formatstr.clone(),
                    sendable: ty.sendable,
                },
            );
        }
        for (client, channel) in routing.client_bindings() {
            file.routing.insert(client.to_string(), channel.to_string());
        }
        for (prefix, route) in routing.type_bindings() {
            file.restricted.insert(
                route.channel_id.clone(),
                RestrictionEntry {
                    type_prefix: prefix.to_string(),
                    consume: route.consume,
                },
            );
        }
        file
    }

    /// Rebuild live state, recomputing every derived field and re-inserting
    /// the built-in types when the file omits them. Validation runs the
    /// same mutating operations an operator would, so an inconsistent file
    /// (say, a restricted channel that also holds client bindings) refuses
    /// to load.
    pub fn into_state(self) -> BridgeResult<(TypeRegistry, RoutingTable)> {
        let mut registry = TypeRegistry::new();
        for (prefix, entry) in &self.types {
            registry.register(prefix, &entry.format, entry.sendable)?;
        }

        let mut routing = RoutingTable::new();
        for (client, channel) in &self.routing {
            routing.bind_client(client, channel)?;
        }
        for (channel, entry) in &self.restricted {
            if !registry.contains(&entry.type_prefix) {
                return Err(BridgeError::UnknownType(entry.type_prefix.clone()));
            }
            routing.bind_restriction(channel, &entry.type_prefix, entry.consume)?;
        }

        Ok((registry, routing))
    }
}

/// Load the relay state file, or defaults when it does not exist yet.
pub fn load_state(path: &Path) -> BridgeResult<(TypeRegistry, RoutingTable)> {
    if !path.exists() {
        info!(path = %path.display(), "no relay state file, starting from defaults");
        return Ok((TypeRegistry::new(), RoutingTable::new()));
    }
    let content = std::fs::read_to_string(path)?;
    let file: RelayStateFile = toml::from_str(&content)
        .map_err(|e| BridgeError::Config(format!("relay state parse error: {e}")))?;
    file.into_state()
}

/// Write the relay state file, creating parent directories as needed. The
/// file handle is closed on every path, including failures.
pub async fn save_state(
    path: &Path,
    registry: &TypeRegistry,
    routing: &RoutingTable,
) -> BridgeResult<()> {
    let file = RelayStateFile::from_state(registry, routing);
    let content = toml::to_string_pretty(&file)
        .map_err(|e| BridgeError::Config(format!("relay state encode error: {e}")))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
