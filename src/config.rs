//! Server configuration loading.
//!
//! `servers.json` lists the tool servers the daemon manages. It is searched
//! for in the working directory first, then the platform data directory.
//! A missing file is an empty configuration; a malformed one aborts startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::gateway::errors::GatewayError;
use crate::gateway::types::{ServerConfig, TransportConfig};

/// Top-level shape of `servers.json`.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// First existing config file among the search candidates, if any.
pub fn resolve_path() -> Option<PathBuf> {
    let candidates = [
        PathBuf::from("servers.json"),
        crate::data_dir().join("servers.json"),
    ];
    candidates.into_iter().find(|p| p.exists())
}

/// Load the server list from the resolved config path.
pub fn load() -> anyhow::Result<Vec<ServerConfig>> {
    match resolve_path() {
        Some(path) => load_from(&path),
        None => {
            tracing::info!("no servers.json found, starting with an empty server list");
            Ok(Vec::new())
        }
    }
}

/// Load and validate the server list from one specific file.
pub fn load_from(path: &Path) -> anyhow::Result<Vec<ServerConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: ServersFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut seen = HashSet::new();
    for server in &file.servers {
        validate_server(server)?;
        if !seen.insert(server.name.as_str()) {
            anyhow::bail!(
                "duplicate server name '{}' in {}",
                server.name,
                path.display()
            );
        }
    }

    tracing::info!(
        count = file.servers.len(),
        path = %path.display(),
        "loaded server configuration"
    );
    Ok(file.servers)
}

/// Reject configs that could never connect. Runs at load time and again
/// when a server is added at runtime.
pub fn validate_server(config: &ServerConfig) -> Result<(), GatewayError> {
    if config.name.trim().is_empty() {
        return Err(GatewayError::Config {
            name: config.name.clone(),
            reason: "server name must not be empty".into(),
        });
    }

    match &config.transport {
        TransportConfig::Http { url, .. } => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(GatewayError::Config {
                    name: config.name.clone(),
                    reason: format!("http transport requires an http(s):// url, got '{url}'"),
                });
            }
        }
        TransportConfig::Websocket { url, .. } => {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(GatewayError::Config {
                    name: config.name.clone(),
                    reason: format!("websocket transport requires a ws(s):// url, got '{url}'"),
                });
            }
        }
        TransportConfig::Stdio { command, .. } => {
            if command.trim().is_empty() {
                return Err(GatewayError::Config {
                    name: config.name.clone(),
                    reason: "stdio transport requires a command".into(),
                });
            }
        }
    }

    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
