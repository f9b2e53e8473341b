//! Read-only view of the proxy and its routes
//!
//! Nothing here takes the controller's write lock. A report may observe a
//! replace in flight; that shows up as [`ProxyState::Reloading`].

use crate::config::Settings;
use crate::controller::{candidate_name, previous_name, Lifecycle, SharedHandle, FINGERPRINT_LABEL};
use crate::declared::{ContainerEntry, DeclaredConfig};
use crate::error::{Result, ResultExt};
use crate::nginx::generate;
use crate::runtime::{with_timeout, ContainerInfo, DynRuntime, NetworkInfo};
use crate::store::DynConfigStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    /// No proxy container exists
    Absent,
    Stopped,
    Running,
    /// Running, but at least one route has no live target
    Degraded,
    /// A replace is in flight or its temporary containers are present
    Reloading,
    /// The last write operation left partial progress
    Error,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyState::Absent => "absent",
            ProxyState::Stopped => "stopped",
            ProxyState::Running => "running",
            ProxyState::Degraded => "degraded",
            ProxyState::Reloading => "reloading",
            ProxyState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    /// Target is declared and running
    Reachable,
    /// Target is declared but not running
    Unreachable,
    /// Target is not declared
    Undeclared,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reachability::Reachable => "reachable",
            Reachability::Unreachable => "unreachable",
            Reachability::Undeclared => "undeclared",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteStatus {
    pub host_port: u16,
    pub target: String,
    /// Port on the target the route forwards to, when declared
    pub target_port: Option<u16>,
    pub reachability: Reachability,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyStatus {
    pub proxy_name: String,
    pub state: ProxyState,
    pub lifecycle: String,
    pub routes: Vec<RouteStatus>,
    /// Fingerprint label of the live proxy container
    pub running_fingerprint: Option<String>,
    /// Fingerprint the declared state renders to right now
    pub declared_fingerprint: String,
    pub last_error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl ProxyStatus {
    pub fn route(&self, host_port: u16) -> Option<&RouteStatus> {
        self.routes.iter().find(|r| r.host_port == host_port)
    }

    /// True when the live proxy runs what the declared state renders
    pub fn in_sync(&self) -> bool {
        self.running_fingerprint.as_deref() == Some(self.declared_fingerprint.as_str())
    }
}

/// A declared container with its routes and live state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerReport {
    pub entry: ContainerEntry,
    pub routed_ports: Vec<u16>,
    /// Runtime status string, `None` when the container does not exist
    pub live_state: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub status: ProxyStatus,
    pub containers: Vec<ContainerReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedContainer {
    pub info: ContainerInfo,
    pub declared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReport {
    pub info: NetworkInfo,
    /// Declared containers that live on this network
    pub declared_containers: usize,
}

/// Read path over the runtime, the declared document and the proxy handle
#[derive(Clone)]
pub struct StatusReporter {
    runtime: DynRuntime,
    store: DynConfigStore,
    handle: SharedHandle,
    settings: Settings,
}

impl StatusReporter {
    pub fn new(
        runtime: DynRuntime,
        store: DynConfigStore,
        handle: SharedHandle,
        settings: Settings,
    ) -> Self {
        Self {
            runtime,
            store,
            handle,
            settings,
        }
    }

    pub async fn status(&self) -> Result<ProxyStatus> {
        let declared = self.store.load()?;
        let containers = self.containers(None).await?;
        Ok(self.derive_status(&declared, &containers))
    }

    /// Status plus every declared container with its routed ports and live state
    pub async fn report(&self) -> Result<Report> {
        let declared = self.store.load()?;
        let containers = self.containers(None).await?;
        let status = self.derive_status(&declared, &containers);

        let containers = declared
            .containers
            .iter()
            .map(|entry| {
                let live = containers.iter().find(|c| c.name == entry.name);
                ContainerReport {
                    entry: entry.clone(),
                    routed_ports: declared.routed_ports(&entry.name),
                    live_state: live.map(|c| c.state.clone()),
                    running: live.is_some_and(|c| c.running),
                }
            })
            .collect();

        Ok(Report { status, containers })
    }

    /// Runtime containers, optionally filtered by name, marked when declared
    pub async fn detect(&self, filter: Option<&str>) -> Result<Vec<DetectedContainer>> {
        let declared = self.store.load()?;
        let containers = self
            .containers(filter)
            .await
            .during("detect", filter.unwrap_or("containers"))?;

        Ok(containers
            .into_iter()
            .map(|info| DetectedContainer {
                declared: declared.container(&info.name).is_some(),
                info,
            })
            .collect())
    }

    /// Runtime networks with the number of declared containers on each
    pub async fn networks(&self) -> Result<Vec<NetworkReport>> {
        let declared = self.store.load()?;
        let networks = with_timeout(
            "list_networks",
            self.settings.call_timeout(),
            self.runtime.list_networks(),
        )
        .await
        .during("networks", "list")?;

        Ok(networks
            .into_iter()
            .map(|info| NetworkReport {
                declared_containers: declared
                    .containers
                    .iter()
                    .filter(|c| declared.network_of(c) == info.name)
                    .count(),
                info,
            })
            .collect())
    }

    async fn containers(&self, filter: Option<&str>) -> Result<Vec<ContainerInfo>> {
        with_timeout(
            "list_containers",
            self.settings.call_timeout(),
            self.runtime.list_containers(filter),
        )
        .await
    }

    fn derive_status(&self, declared: &DeclaredConfig, containers: &[ContainerInfo]) -> ProxyStatus {
        let (lifecycle, last_error) = {
            let handle = self.handle.lock();
            (handle.lifecycle, handle.last_error.clone())
        };
        let proxy_name = declared.proxy_name.as_str();

        let running: BTreeSet<String> = containers
            .iter()
            .filter(|c| c.running && declared.container(&c.name).is_some())
            .map(|c| c.name.clone())
            .collect();

        let routes: Vec<RouteStatus> = declared
            .sorted_routes()
            .into_iter()
            .map(|route| {
                let entry = declared.container(&route.target);
                let reachability = match entry {
                    Some(entry) if running.contains(&entry.name) => Reachability::Reachable,
                    Some(_) => Reachability::Unreachable,
                    None => Reachability::Undeclared,
                };
                RouteStatus {
                    host_port: route.host_port,
                    target: route.target.clone(),
                    target_port: entry.map(ContainerEntry::effective_port),
                    reachability,
                }
            })
            .collect();

        let proxy = containers.iter().find(|c| c.name == proxy_name);
        let candidate = candidate_name(proxy_name);
        let previous = previous_name(proxy_name);
        let replacing = containers
            .iter()
            .any(|c| c.name == candidate || c.name == previous);

        let state = if lifecycle == Lifecycle::Reloading || replacing {
            ProxyState::Reloading
        } else if lifecycle == Lifecycle::Error {
            ProxyState::Error
        } else {
            match proxy {
                None => ProxyState::Absent,
                Some(p) if !p.running => ProxyState::Stopped,
                Some(_) if routes.iter().any(|r| r.reachability != Reachability::Reachable) => {
                    ProxyState::Degraded
                }
                Some(_) => ProxyState::Running,
            }
        };

        let declared_fingerprint = generate(declared, &running, &self.settings.base_image).fingerprint;

        ProxyStatus {
            proxy_name: proxy_name.to_string(),
            state,
            lifecycle: lifecycle.to_string(),
            routes,
            running_fingerprint: proxy
                .filter(|p| p.running)
                .and_then(|p| p.labels.get(FINGERPRINT_LABEL).cloned()),
            declared_fingerprint,
            last_error,
            observed_at: Utc::now(),
        }
    }
}
