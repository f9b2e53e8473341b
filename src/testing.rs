//! In-memory runtime for tests, built with the `testing` feature
//!
//! `FakeRuntime` models just enough of a container daemon for the controller:
//! named containers with images, networks and host port bindings, built images
//! keyed by tag, and per-container log lines. Failures can be injected per
//! operation.

use crate::error::{Error, Result};
use crate::nginx::BuildContext;
use crate::runtime::{ContainerInfo, LogStream, NetworkInfo, RunSpec, RuntimeClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    image: String,
    running: bool,
    state: String,
    networks: Vec<String>,
    ports: Vec<u16>,
    labels: BTreeMap<String, String>,
}

impl FakeContainer {
    fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            state: self.state.clone(),
            running: self.running,
            networks: self.networks.clone(),
            labels: self.labels.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, String>,
    images: BTreeMap<String, (String, BuildContext)>,
    logs: BTreeMap<String, Vec<String>>,
    calls: Vec<String>,
    next_id: u64,
    unavailable: bool,
    build_error: Option<String>,
    failing_runs: BTreeSet<String>,
    crashing: BTreeSet<String>,
    refusing: BTreeSet<String>,
    occupied_ports: BTreeSet<u16>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }

    fn check(&mut self, call: String) -> Result<()> {
        let operation = call.split(' ').next().unwrap_or_default().to_string();
        self.calls.push(call);
        if self.unavailable {
            return Err(Error::unavailable(operation, "connection refused"));
        }
        Ok(())
    }

    fn container_mut(&mut self, name: &str) -> Result<&mut FakeContainer> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| Error::not_found("container", name))
    }

    /// First port in `ports` already held by a running container or an outside process
    fn port_conflict(&self, owner: &str, ports: &[u16]) -> Option<u16> {
        ports.iter().copied().find(|port| {
            self.occupied_ports.contains(port)
                || self
                    .containers
                    .values()
                    .any(|c| c.running && c.name != owner && c.ports.contains(port))
        })
    }
}

/// In-memory [`RuntimeClient`]
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        runtime.add_network("bridge");
        runtime
    }

    pub fn add_network(&self, name: &str) {
        let mut state = self.state.lock();
        if !state.networks.contains_key(name) {
            let id = state.next_id("net");
            state.networks.insert(name.to_string(), id);
        }
    }

    /// Seed an application container attached to `networks`
    pub fn add_container(&self, name: &str, networks: &[&str], running: bool) {
        for network in networks {
            self.add_network(network);
        }
        let mut state = self.state.lock();
        let id = state.next_id("c");
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                name: name.to_string(),
                image: format!("{}:latest", name),
                running,
                state: if running { "running" } else { "exited" }.to_string(),
                networks: networks.iter().map(|n| n.to_string()).collect(),
                ports: Vec::new(),
                labels: BTreeMap::new(),
            },
        );
    }

    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(container) = self.state.lock().containers.get_mut(name) {
            container.running = running;
            container.state = if running { "running" } else { "exited" }.to_string();
        }
    }

    pub fn push_log(&self, name: &str, line: &str) {
        self.state
            .lock()
            .logs
            .entry(name.to_string())
            .or_default()
            .push(line.to_string());
    }

    /// Make every call fail with `RuntimeUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Make image builds fail with the given output; `None` restores success
    pub fn fail_builds(&self, stderr: Option<&str>) {
        self.state.lock().build_error = stderr.map(str::to_string);
    }

    /// Make `run_container` fail for the given container name
    pub fn fail_run(&self, name: &str) {
        self.state.lock().failing_runs.insert(name.to_string());
    }

    pub fn clear_run_failures(&self) {
        self.state.lock().failing_runs.clear();
    }

    /// Containers with this name are created but exit immediately
    pub fn crash_on_start(&self, name: &str) {
        self.state.lock().crashing.insert(name.to_string());
    }

    pub fn clear_crashes(&self) {
        self.state.lock().crashing.clear();
    }

    /// Containers with this name run but never accept connections
    pub fn refuse_connections(&self, name: &str) {
        self.state.lock().refusing.insert(name.to_string());
    }

    pub fn clear_refusals(&self) {
        self.state.lock().refusing.clear();
    }

    /// Hold a host port outside of any container
    pub fn occupy_port(&self, port: u16) {
        self.state.lock().occupied_ports.insert(port);
    }

    pub fn release_port(&self, port: u16) {
        self.state.lock().occupied_ports.remove(&port);
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.state.lock().containers.get(name).map(FakeContainer::info)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    /// Host ports bound by a container
    pub fn ports_of(&self, name: &str) -> Vec<u16> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.ports.clone())
            .unwrap_or_default()
    }

    /// nginx.conf baked into the image a container runs
    pub fn running_config(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        let container = state.containers.get(name)?;
        let (_, context) = state.images.get(&container.image)?;
        context.nginx_conf().map(str::to_string)
    }

    pub fn image_tags(&self) -> Vec<String> {
        self.state.lock().images.keys().cloned().collect()
    }

    /// Every call made so far, as `"<operation> <subject>"`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let mut state = self.state.lock();
        state.check(format!("list_containers {}", filter.unwrap_or("*")))?;
        let needle = filter.map(str::to_lowercase);
        Ok(state
            .containers
            .values()
            .filter(|c| match &needle {
                Some(needle) => c.name.to_lowercase().contains(needle),
                None => true,
            })
            .map(FakeContainer::info)
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        let mut state = self.state.lock();
        state.check(format!("inspect_container {}", name))?;
        state
            .containers
            .values()
            .find(|c| c.name == name || c.id == name)
            .map(FakeContainer::info)
            .ok_or_else(|| Error::not_found("container", name))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let mut state = self.state.lock();
        state.check("list_networks *".to_string())?;
        Ok(state
            .networks
            .iter()
            .map(|(name, id)| NetworkInfo {
                id: id.clone(),
                name: name.clone(),
                driver: "bridge".to_string(),
                scope: "local".to_string(),
                containers: state
                    .containers
                    .values()
                    .filter(|c| c.networks.contains(name))
                    .count(),
            })
            .collect())
    }

    async fn ensure_network(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.check(format!("ensure_network {}", name))?;
        if let Some(id) = state.networks.get(name) {
            return Ok(id.clone());
        }
        let id = state.next_id("net");
        state.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn connect(&self, container: &str, network: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(format!("connect {} {}", container, network))?;
        if !state.networks.contains_key(network) {
            return Err(Error::not_found("network", network));
        }
        let entry = state.container_mut(container)?;
        if !entry.networks.iter().any(|n| n == network) {
            entry.networks.push(network.to_string());
        }
        Ok(())
    }

    async fn build_image(&self, tag: &str, context: &BuildContext) -> Result<String> {
        let mut state = self.state.lock();
        state.check(format!("build_image {}", tag))?;
        if let Some(stderr) = state.build_error.clone() {
            return Err(Error::BuildFailed {
                tag: tag.to_string(),
                stderr,
            });
        }
        if context.dockerfile().is_none() {
            return Err(Error::BuildFailed {
                tag: tag.to_string(),
                stderr: "Cannot locate specified Dockerfile: Dockerfile".to_string(),
            });
        }
        let id = format!("sha256:{}", state.next_id("img"));
        state
            .images
            .insert(tag.to_string(), (id.clone(), context.clone()));
        Ok(id)
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let mut state = self.state.lock();
        state.check(format!("run_container {}", spec.name))?;

        if state.failing_runs.contains(&spec.name) {
            return Err(Error::Runtime {
                operation: "run_container".to_string(),
                reason: format!("injected failure for {}", spec.name),
            });
        }
        if state.containers.contains_key(&spec.name) {
            return Err(Error::NameConflict {
                name: spec.name.clone(),
            });
        }
        if !state.images.contains_key(&spec.image) {
            return Err(Error::not_found("image", &spec.image));
        }
        if let Some(network) = spec.networks.iter().find(|n| !state.networks.contains_key(*n)) {
            return Err(Error::not_found("network", network));
        }
        if let Some(port) = state.port_conflict(&spec.name, &spec.port_bindings) {
            return Err(Error::PortInUse {
                container: spec.name.clone(),
                reason: format!("Bind for 0.0.0.0:{} failed: port is already allocated", port),
            });
        }

        let crashed = state.crashing.contains(&spec.name);
        let id = state.next_id("c");
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: !crashed,
                state: if crashed { "exited" } else { "running" }.to_string(),
                networks: spec.networks.clone(),
                ports: spec.port_bindings.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(format!("start_container {}", name))?;
        let ports = state.container_mut(name)?.ports.clone();
        if let Some(port) = state.port_conflict(name, &ports) {
            return Err(Error::PortInUse {
                container: name.to_string(),
                reason: format!("Bind for 0.0.0.0:{} failed: port is already allocated", port),
            });
        }
        let crashed = state.crashing.contains(name);
        let container = state.container_mut(name)?;
        container.running = !crashed;
        container.state = if crashed { "exited" } else { "running" }.to_string();
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(format!("stop_container {}", name))?;
        if let Some(container) = state.containers.get_mut(name) {
            container.running = false;
            container.state = "exited".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(format!("remove_container {}", name))?;
        state.containers.remove(name);
        Ok(())
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(format!("rename_container {} {}", name, new_name))?;
        if state.containers.contains_key(new_name) {
            return Err(Error::NameConflict {
                name: new_name.to_string(),
            });
        }
        let mut container = state
            .containers
            .remove(name)
            .ok_or_else(|| Error::not_found("container", name))?;
        container.name = new_name.to_string();
        state.containers.insert(new_name.to_string(), container);
        if let Some(lines) = state.logs.remove(name) {
            state.logs.insert(new_name.to_string(), lines);
        }
        Ok(())
    }

    async fn accepts_connections(&self, name: &str, port: u16) -> Result<bool> {
        let mut state = self.state.lock();
        state.check(format!("accepts_connections {} {}", name, port))?;
        let running = state.container_mut(name)?.running;
        Ok(running && !state.refusing.contains(name))
    }

    async fn stream_logs(&self, name: &str, follow: bool, tail: usize) -> Result<LogStream> {
        let lines = {
            let mut state = self.state.lock();
            state.check(format!("stream_logs {}", name))?;
            if !state.containers.contains_key(name) {
                return Err(Error::not_found("container", name));
            }
            let all = state.logs.get(name).cloned().unwrap_or_default();
            let start = all.len().saturating_sub(tail);
            all[start..].to_vec()
        };

        if !follow {
            return Ok(LogStream::from_lines(lines));
        }

        // a followed stream stays open until the consumer cancels it
        let (sink, stream) = LogStream::channel(lines.len().max(1));
        tokio::spawn(async move {
            for line in lines {
                if !sink.send(Ok(line)).await {
                    return;
                }
            }
            sink.cancelled().await;
        });
        Ok(stream)
    }
}
