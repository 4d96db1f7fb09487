//! The persisted MCP server registry (`~/.rosiwit/mcp.json`).
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "servers": {
//!     "files": { "transport": "stdio", "command": "npx", "args": ["-y", "server-fs"] },
//!     "search": { "transport": "sse", "url": "http://localhost:8931/sse", "disabled": true }
//!   }
//! }
//! ```
//!
//! A missing or malformed file yields an empty registry, and a malformed
//! server entry is skipped on its own. Neither is fatal. Servers keep the
//! order they are written in; that order decides tool routing.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ConfigError;

/// Root of the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRegistryFile {
    #[serde(default = "default_version")]
    pub version: String,

    /// Servers keyed by name, in file order.
    #[serde(default)]
    pub servers: ServerTable,
}

fn default_version() -> String {
    "1.0".into()
}

impl Default for McpRegistryFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            servers: ServerTable::default(),
        }
    }
}

/// Named server entries in the order they were written.
///
/// Serialized as a JSON object. When reading, an entry that does not
/// parse is logged and left out; its siblings are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerTable(Vec<(String, ServerEntry)>);

impl ServerTable {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ServerEntry> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServerEntry> {
        self.0.iter_mut().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    /// Add a server at the end, or replace a same-named one in place.
    pub fn insert(&mut self, name: impl Into<String>, entry: ServerEntry) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(existing) => *existing = entry,
            None => self.0.push((name, entry)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServerEntry)> {
        self.0.iter().map(|(n, e)| (n.as_str(), e))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }
}

impl FromIterator<(String, ServerEntry)> for ServerTable {
    fn from_iter<I: IntoIterator<Item = (String, ServerEntry)>>(iter: I) -> Self {
        let mut table = Self::default();
        for (name, entry) in iter {
            table.insert(name, entry);
        }
        table
    }
}

impl Serialize for ServerTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(n, e)| (n, e)))
    }
}

impl<'de> Deserialize<'de> for ServerTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = ServerTable;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of server names to server entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ServerTable, A::Error> {
                let mut table = ServerTable::default();
                while let Some((name, raw)) = map.next_entry::<String, serde_json::Value>()? {
                    match ServerEntry::deserialize(raw) {
                        Ok(entry) => table.insert(name, entry),
                        Err(e) => warn!(server = %name, error = %e, "Skipping invalid MCP server entry"),
                    }
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

/// One server in the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

/// Connection parameters, discriminated by the `transport` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport")]
pub enum TransportConfig {
    /// Spawn a subprocess and speak over its stdin/stdout.
    #[serde(rename = "stdio", alias = "pipe")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },

    /// Connect to an HTTP event stream.
    #[serde(rename = "sse", alias = "event-stream")]
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Sse => f.write_str("sse"),
        }
    }
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
        }
    }

    /// Expand `~` and `${VAR}` references. Unresolvable references are left as written.
    pub fn expanded(&self) -> Self {
        match self {
            Self::Stdio { command, args, env } => Self::Stdio {
                command: expand(command),
                args: args.iter().map(|a| expand(a)).collect(),
                env: env.iter().map(|(k, v)| (k.clone(), expand(v))).collect(),
            },
            Self::Sse { url, headers } => Self::Sse {
                url: expand(url),
                headers: headers.iter().map(|(k, v)| (k.clone(), expand(v))).collect(),
            },
        }
    }
}

fn expand(s: &str) -> String {
    shellexpand::full(s)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// A named server as seen by the runtime. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: TransportConfig,
    pub disabled: bool,
}

impl ServerDescriptor {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            disabled: false,
        }
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

impl McpRegistryFile {
    /// `~/.rosiwit/mcp.json`
    pub fn default_path() -> PathBuf {
        crate::AppConfig::config_dir().join("mcp.json")
    }

    /// Load the registry, falling back to an empty one on any failure.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No MCP registry at {}, starting with no servers", path.display());
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read MCP registry, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed MCP registry, using defaults");
                Self::default()
            }
        }
    }

    /// Write the registry as pretty-printed JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| write_err(e.to_string()))
    }

    /// Every server, in file order, with raw (unexpanded) parameters.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers
            .iter()
            .map(|(name, entry)| ServerDescriptor {
                name: name.to_string(),
                transport: entry.transport.clone(),
                disabled: entry.disabled,
            })
            .collect()
    }

    /// Servers that are not disabled, in file order, with `${VAR}` references expanded.
    pub fn enabled_servers(&self) -> Vec<ServerDescriptor> {
        self.servers
            .iter()
            .filter(|(_, entry)| !entry.disabled)
            .map(|(name, entry)| ServerDescriptor::new(name, entry.transport.expanded()))
            .collect()
    }

    /// Rebuild a registry file from descriptors. The disabled flags are kept.
    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = ServerDescriptor>,
    {
        let servers = descriptors
            .into_iter()
            .map(|d| {
                (
                    d.name,
                    ServerEntry {
                        transport: d.transport,
                        disabled: d.disabled,
                    },
                )
            })
            .collect();
        Self {
            version: default_version(),
            servers,
        }
    }

    pub fn set_disabled(&mut self, name: &str, disabled: bool) -> Result<(), ConfigError> {
        let entry = self
            .servers
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownServer(name.to_string()))?;
        entry.disabled = disabled;
        Ok(())
    }
}
