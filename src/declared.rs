//! Declared state: the containers and routes the proxy converges toward

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Port used for a container without an explicit port, and for `switch`
/// without an explicit host port
pub const DEFAULT_PORT: u16 = 8000;

pub const DEFAULT_PROXY_NAME: &str = "proxy-manager";
pub const DEFAULT_NETWORK: &str = "proxy-net";

/// A container the proxy may route to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerEntry {
    /// Runtime container name, also the DNS name the proxy resolves
    pub name: String,
    /// Display label; also accepted as an identifier by `switch` and `remove`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Port the container listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Network the container lives on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl ContainerEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            port: None,
            network: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// A host port forwarded to a declared container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteEntry {
    pub host_port: u16,
    pub target: String,
}

/// The declared configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredConfig {
    #[serde(default)]
    pub containers: Vec<ContainerEntry>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default = "default_proxy_name")]
    pub proxy_name: String,
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for DeclaredConfig {
    fn default() -> Self {
        Self {
            containers: Vec::new(),
            routes: Vec::new(),
            proxy_name: default_proxy_name(),
            network: default_network(),
        }
    }
}

fn default_proxy_name() -> String {
    DEFAULT_PROXY_NAME.to_string()
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

/// Whether an upsert created a new record or changed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
}

impl DeclaredConfig {
    /// Look up a container by name, falling back to its label
    pub fn find_container(&self, identifier: &str) -> Option<&ContainerEntry> {
        self.container(identifier).or_else(|| {
            self.containers
                .iter()
                .find(|c| c.label.as_deref() == Some(identifier))
        })
    }

    /// Look up a container by exact name
    pub fn container(&self, name: &str) -> Option<&ContainerEntry> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn route(&self, host_port: u16) -> Option<&RouteEntry> {
        self.routes.iter().find(|r| r.host_port == host_port)
    }

    /// Routes sorted ascending by host port
    pub fn sorted_routes(&self) -> Vec<&RouteEntry> {
        let mut routes: Vec<&RouteEntry> = self.routes.iter().collect();
        routes.sort_by_key(|r| r.host_port);
        routes
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.sorted_routes().iter().map(|r| r.host_port).collect()
    }

    /// Host ports currently routed to `name`
    pub fn routed_ports(&self, name: &str) -> Vec<u16> {
        self.sorted_routes()
            .into_iter()
            .filter(|r| r.target == name)
            .map(|r| r.host_port)
            .collect()
    }

    /// The network a container is reached on: its own, or the proxy network
    pub fn network_of<'a>(&'a self, container: &'a ContainerEntry) -> &'a str {
        container.network.as_deref().unwrap_or(&self.network)
    }

    /// The proxy network plus every declared container network
    pub fn networks(&self) -> BTreeSet<String> {
        let mut networks = BTreeSet::new();
        networks.insert(self.network.clone());
        networks.extend(self.containers.iter().filter_map(|c| c.network.clone()));
        networks
    }

    /// Insert a container or merge the given fields into an existing entry
    pub fn upsert_container(&mut self, entry: ContainerEntry) -> Upsert {
        if let Some(existing) = self.containers.iter_mut().find(|c| c.name == entry.name) {
            if entry.label.is_some() {
                existing.label = entry.label;
            }
            if entry.port.is_some() {
                existing.port = entry.port;
            }
            if entry.network.is_some() {
                existing.network = entry.network;
            }
            return Upsert::Updated;
        }
        self.containers.push(entry);
        Upsert::Added
    }

    /// Remove a container and every route targeting it.
    ///
    /// Returns the removed entry and the routes that went with it.
    pub fn remove_container(&mut self, identifier: &str) -> Option<(ContainerEntry, Vec<RouteEntry>)> {
        let name = self.find_container(identifier)?.name.clone();
        let index = self.containers.iter().position(|c| c.name == name)?;
        let entry = self.containers.remove(index);

        let (removed, kept): (Vec<RouteEntry>, Vec<RouteEntry>) = self
            .routes
            .drain(..)
            .partition(|r| r.target == name);
        self.routes = kept;

        Some((entry, removed))
    }

    /// Point `host_port` at `target`, creating the route if needed.
    ///
    /// Returns the previous target when the route existed.
    pub fn upsert_route(&mut self, host_port: u16, target: &str) -> Option<String> {
        let previous = match self.routes.iter_mut().find(|r| r.host_port == host_port) {
            Some(route) => Some(std::mem::replace(&mut route.target, target.to_string())),
            None => {
                self.routes.push(RouteEntry {
                    host_port,
                    target: target.to_string(),
                });
                None
            }
        };
        self.routes.sort_by_key(|r| r.host_port);
        previous
    }

    pub fn remove_route(&mut self, host_port: u16) -> Option<RouteEntry> {
        let index = self.routes.iter().position(|r| r.host_port == host_port)?;
        Some(self.routes.remove(index))
    }

    /// Check the document invariants. Runs before every persist.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = validate_name("proxy_name", &self.proxy_name) {
            errors.push(e);
        }
        if let Err(e) = validate_name("network", &self.network) {
            errors.push(e);
        }

        let mut names = HashSet::new();
        for container in &self.containers {
            if let Err(e) = validate_name("container name", &container.name) {
                errors.push(e);
            }
            if !names.insert(container.name.as_str()) {
                errors.push(format!("duplicate container name '{}'", container.name));
            }
            if container.port == Some(0) {
                errors.push(format!("container '{}': port must be in 1..=65535", container.name));
            }
            if let Some(network) = &container.network {
                if let Err(e) = validate_name("network", network) {
                    errors.push(format!("container '{}': {}", container.name, e));
                }
            }
            if container.name == self.proxy_name {
                errors.push(format!(
                    "container '{}' has the same name as the proxy",
                    container.name
                ));
            }
        }

        let mut ports = HashSet::new();
        for route in &self.routes {
            if route.host_port == 0 {
                errors.push("route host_port must be in 1..=65535".to_string());
            }
            if !ports.insert(route.host_port) {
                errors.push(format!("duplicate route for host port {}", route.host_port));
            }
            if let Err(e) = validate_name("route target", &route.target) {
                errors.push(format!("route {}: {}", route.host_port, e));
            }
        }

        if !errors.is_empty() {
            return Err(Error::Validation(errors.join("; ")));
        }
        Ok(())
    }
}

/// Docker object names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`. The generator embeds
/// container names in nginx.conf, so this also keeps the output well formed.
pub fn validate_name(what: &str, name: &str) -> std::result::Result<(), String> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!("{} '{}' is not a valid Docker name", what, name))
    }
}
