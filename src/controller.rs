//! Proxy lifecycle: build, start, stop, reload and route switching
//!
//! Every write operation holds `write_lock` for its whole duration, so at most
//! one of them touches the runtime or the declared document at a time. The
//! status read path only looks at the shared [`ProxyHandle`] and the runtime.

use crate::config::Settings;
use crate::declared::{ContainerEntry, DeclaredConfig, RouteEntry, Upsert, DEFAULT_PORT};
use crate::error::{Error, Result, ResultExt};
use crate::nginx::{generate, GeneratedArtifact};
use crate::runtime::{found, with_timeout, ContainerInfo, DynRuntime, LogStream, RunSpec};
use crate::status::{ProxyStatus, StatusReporter};
use crate::store::DynConfigStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Container label carrying the fingerprint of the configuration a proxy runs
pub const FINGERPRINT_LABEL: &str = "proxy-manager.fingerprint";

/// Container label naming the proxy a container belongs to
pub const PROXY_LABEL: &str = "proxy-manager.proxy";

/// Networks the proxy is never attached to
const UNATTACHABLE_NETWORKS: &[&str] = &["host", "none", "bridge"];

/// Name of the replacement container verified during reload
pub fn candidate_name(proxy: &str) -> String {
    format!("{}-next", proxy)
}

/// Name the old proxy container holds while its replacement is promoted
pub fn previous_name(proxy: &str) -> String {
    format!("{}-prev", proxy)
}

/// Controller view of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Absent,
    Building,
    Starting,
    Running,
    Reloading,
    Stopping,
    /// The last write operation left partial progress behind
    Error,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Absent => "absent",
            Lifecycle::Building => "building",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Reloading => "reloading",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub tag: String,
    pub image_id: String,
    pub fingerprint: String,
}

/// State owned by the controller and shared with status readers
#[derive(Debug, Clone, Default)]
pub struct ProxyHandle {
    /// Last image built by this controller
    pub image: Option<BuiltImage>,
    pub lifecycle: Lifecycle,
    pub last_error: Option<String>,
}

pub type SharedHandle = Arc<Mutex<ProxyHandle>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { container_id: String, image: BuiltImage },
    /// The live proxy already runs the current configuration
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Containers that were stopped and removed
    Stopped { removed: Vec<String> },
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No proxy was live, so a fresh one was started
    Started { container_id: String, image: BuiltImage },
    /// The live proxy was replaced by one built from the current configuration
    Replaced {
        container_id: String,
        image: BuiltImage,
        previous_fingerprint: Option<String>,
    },
}

impl ReloadOutcome {
    pub fn image(&self) -> &BuiltImage {
        match self {
            ReloadOutcome::Started { image, .. } | ReloadOutcome::Replaced { image, .. } => image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub host_port: u16,
    pub target: String,
    /// Target the route pointed at before the switch
    pub previous: Option<String>,
    pub reload: ReloadOutcome,
}

/// What happened to the proxy after a route was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAfterRemoval {
    Reloaded(ReloadOutcome),
    /// The last route was removed
    Stopped(StopOutcome),
    /// No proxy was live; only the document changed
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRemoval {
    pub route: RouteEntry,
    pub proxy: ProxyAfterRemoval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub upsert: Upsert,
    /// The stored entry after the merge
    pub entry: ContainerEntry,
    /// Network detected from the runtime, if one was used
    pub network_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRemoval {
    pub entry: ContainerEntry,
    pub routes: Vec<RouteEntry>,
}

/// Runtime facts gathered once per operation
#[derive(Debug, Default)]
struct Observation {
    /// Declared containers that are running
    running: BTreeSet<String>,
    /// Networks the proxy must be attached to, proxy network first
    networks: Vec<String>,
    proxy: Option<ContainerInfo>,
    candidate: Option<ContainerInfo>,
    previous: Option<ContainerInfo>,
}

impl Observation {
    fn live_proxy(&self) -> Option<&ContainerInfo> {
        self.proxy.as_ref().filter(|p| p.running)
    }
}

pub struct ProxyController {
    runtime: DynRuntime,
    store: DynConfigStore,
    settings: Settings,
    handle: SharedHandle,
    write_lock: tokio::sync::Mutex<()>,
}

impl ProxyController {
    pub fn new(
        runtime: DynRuntime,
        store: DynConfigStore,
        settings: Settings,
        handle: SharedHandle,
    ) -> Self {
        Self {
            runtime,
            store,
            settings,
            handle,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.handle.lock().lifecycle
    }

    pub fn handle(&self) -> SharedHandle {
        self.handle.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn declared(&self) -> Result<DeclaredConfig> {
        self.store.load()
    }

    /// Read-only reporter sharing this controller's runtime, store and handle
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(
            self.runtime.clone(),
            self.store.clone(),
            self.handle.clone(),
            self.settings.clone(),
        )
    }

    pub async fn status(&self) -> Result<ProxyStatus> {
        self.reporter().status().await
    }

    /// The artifact a build would produce right now
    pub async fn render(&self) -> Result<GeneratedArtifact> {
        let declared = self.store.load()?;
        let observed = self.observe(&declared).await.during("render", "proxy configuration")?;
        Ok(self.generate(&declared, &observed))
    }

    /// Generate and build the proxy image without touching containers
    pub async fn build(&self) -> Result<BuiltImage> {
        let _guard = self.write_lock.lock().await;
        let declared = self.store.load()?;
        let subject = format!("proxy {}", declared.proxy_name);

        let before = self.lifecycle();
        if matches!(before, Lifecycle::Absent) {
            self.set_lifecycle(Lifecycle::Building);
        }
        let result = async {
            let observed = self.observe(&declared).await?;
            let artifact = self.generate(&declared, &observed);
            self.build_artifact(&artifact).await
        }
        .await;
        self.set_lifecycle(before);

        result.during("build", subject)
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        let _guard = self.write_lock.lock().await;
        self.start_locked().await
    }

    /// Stop and remove the proxy and any replace leftovers
    pub async fn stop_proxy(&self) -> Result<StopOutcome> {
        let _guard = self.write_lock.lock().await;
        let declared = self.store.load()?;
        self.stop_locked(&declared).await
    }

    pub async fn restart(&self) -> Result<StartOutcome> {
        let _guard = self.write_lock.lock().await;
        let declared = self.store.load()?;
        self.stop_locked(&declared).await?;
        self.start_locked().await.during("restart", format!("proxy {}", declared.proxy_name))
    }

    /// Rebuild from the declared state and replace the live proxy
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        let _guard = self.write_lock.lock().await;
        self.reload_locked().await
    }

    /// Point `host_port` (default 8000) at the container named or labelled
    /// `identifier`, then reload. Declared state is restored if the reload fails.
    pub async fn switch_route(&self, identifier: &str, host_port: Option<u16>) -> Result<SwitchOutcome> {
        let _guard = self.write_lock.lock().await;
        let host_port = host_port.unwrap_or(DEFAULT_PORT);
        let subject = format!("route {} to {}", host_port, identifier);

        let state = self.lifecycle();
        if state == Lifecycle::Error {
            return Err(Error::InvalidState {
                operation: "switch",
                state,
            });
        }
        if host_port == 0 {
            return Err(Error::Validation("host port must be in 1..=65535".to_string()));
        }

        let original = self.store.load()?;
        let target = original
            .find_container(identifier)
            .map(|c| c.name.clone())
            .ok_or_else(|| Error::not_found("container", identifier))
            .during("switch", subject.as_str())?;

        let mut declared = original.clone();
        let previous = declared.upsert_route(host_port, &target);
        self.store.save(&declared).during("switch", subject.as_str())?;
        info!(host_port, target = %target, previous = ?previous, "Route switched");

        match self.reload_locked().await {
            Ok(reload) => Ok(SwitchOutcome {
                host_port,
                target,
                previous,
                reload,
            }),
            Err(e) => {
                self.restore_declared(&original);
                Err(e).during("switch", subject)
            }
        }
    }

    /// Remove the route on `host_port` and reload, or stop the proxy when no
    /// routes remain. Declared state is restored if that fails.
    pub async fn remove_route_and_reload(&self, host_port: u16) -> Result<RouteRemoval> {
        let _guard = self.write_lock.lock().await;
        let subject = format!("route {}", host_port);

        let original = self.store.load()?;
        let mut declared = original.clone();
        let route = declared
            .remove_route(host_port)
            .ok_or_else(|| Error::not_found("route", host_port.to_string()))
            .during("remove route", subject.as_str())?;
        self.store.save(&declared).during("remove route", subject.as_str())?;
        info!(host_port, target = %route.target, "Route removed");

        let result = if declared.routes.is_empty() {
            self.stop_locked(&declared).await.map(ProxyAfterRemoval::Stopped)
        } else {
            let observed = self.observe(&declared).await;
            match observed {
                Ok(observed) if observed.live_proxy().is_none() => {
                    debug!(host_port, "No live proxy, skipping reload");
                    Ok(ProxyAfterRemoval::NotRunning)
                }
                Ok(_) => self.reload_locked().await.map(ProxyAfterRemoval::Reloaded),
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(proxy) => Ok(RouteRemoval { route, proxy }),
            Err(e) => {
                self.restore_declared(&original);
                Err(e).during("remove route", subject)
            }
        }
    }

    /// Declare a container, or merge fields into an existing declaration.
    ///
    /// Without an explicit network the container's first live network is
    /// used as a hint.
    pub async fn add_container(&self, entry: ContainerEntry) -> Result<AddOutcome> {
        let _guard = self.write_lock.lock().await;
        let subject = format!("container {}", entry.name);
        crate::declared::validate_name("container name", &entry.name).map_err(Error::Validation)?;

        let mut declared = self.store.load()?;
        let needs_hint = entry.network.is_none()
            && declared
                .container(&entry.name)
                .map_or(true, |existing| existing.network.is_none());

        let network_hint = if needs_hint {
            self.detect_network(&entry.name).await.during("add", subject.as_str())?
        } else {
            None
        };

        let mut entry = entry;
        if entry.network.is_none() {
            entry.network = network_hint.clone();
        }
        let name = entry.name.clone();
        let upsert = declared.upsert_container(entry);
        self.store.save(&declared).during("add", subject.as_str())?;

        let entry = declared
            .container(&name)
            .cloned()
            .ok_or_else(|| Error::not_found("container", name.as_str()))?;
        info!(container = %name, ?upsert, network = ?entry.network, "Container declared");

        Ok(AddOutcome {
            upsert,
            entry,
            network_hint,
        })
    }

    /// Forget a container (by name or label) and every route targeting it.
    /// The proxy is not reloaded.
    pub async fn remove_container(&self, identifier: &str) -> Result<ContainerRemoval> {
        let _guard = self.write_lock.lock().await;
        let mut declared = self.store.load()?;
        let (entry, routes) = declared
            .remove_container(identifier)
            .ok_or_else(|| Error::not_found("container", identifier))
            .during("remove", format!("container {}", identifier))?;
        self.store
            .save(&declared)
            .during("remove", format!("container {}", entry.name))?;

        info!(container = %entry.name, routes = routes.len(), "Container removed");
        Ok(ContainerRemoval { entry, routes })
    }

    /// Stream the proxy container's logs
    pub async fn logs(&self, follow: bool, tail: usize) -> Result<LogStream> {
        let declared = self.store.load()?;
        let proxy = declared.proxy_name.as_str();
        self.call("stream_logs", self.runtime.stream_logs(proxy, follow, tail))
            .await
            .during("logs", format!("proxy {}", proxy))
    }

    async fn start_locked(&self) -> Result<StartOutcome> {
        let state = self.lifecycle();
        if state == Lifecycle::Error {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        }

        let declared = self.store.load()?;
        let subject = format!("proxy {}", declared.proxy_name);
        self.require_routes(&declared).during("start", subject.as_str())?;

        let observed = self.observe(&declared).await.during("start", subject.as_str())?;
        let artifact = self.generate(&declared, &observed);

        if let Some(live) = observed.live_proxy() {
            self.set_lifecycle(Lifecycle::Running);
            let running = live.labels.get(FINGERPRINT_LABEL).cloned();
            if running.as_deref() == Some(artifact.fingerprint.as_str()) {
                debug!(proxy = %declared.proxy_name, "Proxy already running current configuration");
                return Ok(StartOutcome::AlreadyRunning);
            }
            return Err(Error::ConfigDrift {
                proxy: declared.proxy_name.clone(),
                running: running
                    .map(|f| short(&f).to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                declared: artifact.short_fingerprint().to_string(),
            });
        }

        self.remove_leftovers(&declared.proxy_name, &observed)
            .await
            .during("start", subject.as_str())?;

        let (container_id, image) = self
            .start_fresh(&declared, &observed, &artifact)
            .await
            .during("start", subject)?;
        Ok(StartOutcome::Started { container_id, image })
    }

    /// Build if needed, then run the canonical proxy container
    async fn start_fresh(
        &self,
        declared: &DeclaredConfig,
        observed: &Observation,
        artifact: &GeneratedArtifact,
    ) -> Result<(String, BuiltImage)> {
        let proxy = declared.proxy_name.as_str();
        let before = self.lifecycle();

        self.set_lifecycle(Lifecycle::Building);
        let image = match self.ensure_image(artifact).await {
            Ok(image) => image,
            Err(e) => {
                self.set_lifecycle(before);
                return Err(e);
            }
        };

        self.set_lifecycle(Lifecycle::Starting);
        let started = async {
            self.ensure_networks(&observed.networks).await?;
            let spec = self.run_spec(proxy, &image, artifact, &observed.networks, true);
            let container_id = self.call("run_container", self.runtime.run_container(&spec)).await?;
            self.wait_ready(proxy, &artifact.host_ports()).await?;
            Ok::<_, Error>(container_id)
        }
        .await;

        match started {
            Ok(container_id) => {
                self.set_lifecycle(Lifecycle::Running);
                info!(proxy, image = %image.tag, ports = ?artifact.host_ports(), "Proxy started");
                Ok((container_id, image))
            }
            Err(e) => {
                self.fail(&e);
                Err(e).during("run", format!("{} from built image {}", proxy, image.tag))
            }
        }
    }

    async fn stop_locked(&self, declared: &DeclaredConfig) -> Result<StopOutcome> {
        let proxy = declared.proxy_name.as_str();
        let subject = format!("proxy {}", proxy);
        let before = self.lifecycle();
        if before != Lifecycle::Absent {
            self.set_lifecycle(Lifecycle::Stopping);
        }

        let mut removed = Vec::new();
        for name in [proxy.to_string(), candidate_name(proxy), previous_name(proxy)] {
            let result = async {
                let existing = found(self.call("inspect_container", self.runtime.inspect_container(&name)).await)?;
                if existing.is_none() {
                    return Ok(false);
                }
                self.call("stop_container", self.runtime.stop_container(&name)).await?;
                self.call("remove_container", self.runtime.remove_container(&name)).await?;
                Ok::<_, Error>(true)
            }
            .await;

            match result {
                Ok(true) => removed.push(name),
                Ok(false) => {}
                Err(e) => {
                    self.fail(&e);
                    return Err(e).during("stop", subject);
                }
            }
        }

        {
            let mut handle = self.handle.lock();
            handle.lifecycle = Lifecycle::Absent;
            handle.image = None;
            handle.last_error = None;
        }

        if removed.is_empty() {
            debug!(proxy, "Proxy was not running");
            Ok(StopOutcome::NotRunning)
        } else {
            info!(proxy, removed = ?removed, "Proxy stopped");
            Ok(StopOutcome::Stopped { removed })
        }
    }

    async fn reload_locked(&self) -> Result<ReloadOutcome> {
        let declared = self.store.load()?;
        let proxy = declared.proxy_name.as_str();
        let subject = format!("proxy {}", proxy);
        self.require_routes(&declared).during("reload", subject.as_str())?;

        let observed = self.observe(&declared).await.during("reload", subject.as_str())?;
        let artifact = self.generate(&declared, &observed);

        let Some(live) = observed.live_proxy() else {
            info!(proxy, "No live proxy, starting a fresh one");
            self.remove_leftovers(proxy, &observed)
                .await
                .during("reload", subject.as_str())?;
            let (container_id, image) = self
                .start_fresh(&declared, &observed, &artifact)
                .await
                .during("reload", subject)?;
            return Ok(ReloadOutcome::Started { container_id, image });
        };
        let previous_fingerprint = live.labels.get(FINGERPRINT_LABEL).cloned();

        let before = self.lifecycle();
        self.set_lifecycle(Lifecycle::Reloading);

        let image = match self.ensure_image(&artifact).await {
            Ok(image) => image,
            Err(e) => {
                self.set_lifecycle(settled(before));
                return Err(e).during("reload", subject);
            }
        };

        if let Err(e) = self.verify_candidate(&declared, &observed, &artifact, &image).await {
            self.set_lifecycle(settled(before));
            warn!(proxy, error = %e, "Replacement proxy failed verification");
            return Err(Error::ReloadFailed {
                proxy: proxy.to_string(),
                reason: e.to_string(),
            });
        }

        match self.promote(proxy, &observed, &artifact, &image).await {
            Ok(container_id) => {
                self.set_lifecycle(Lifecycle::Running);
                info!(
                    proxy,
                    image = %image.tag,
                    previous = ?previous_fingerprint.as_deref().map(short),
                    "Proxy reloaded"
                );
                Ok(ReloadOutcome::Replaced {
                    container_id,
                    image,
                    previous_fingerprint,
                })
            }
            Err(e) => Err(Error::ReloadFailed {
                proxy: proxy.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Run the replacement without host ports and check that it stays up.
    /// The candidate is removed again on failure.
    async fn verify_candidate(
        &self,
        declared: &DeclaredConfig,
        observed: &Observation,
        artifact: &GeneratedArtifact,
        image: &BuiltImage,
    ) -> Result<()> {
        let candidate = candidate_name(&declared.proxy_name);

        // leftovers from an interrupted reload
        if observed.candidate.is_some() {
            self.discard(&candidate).await?;
        }
        if observed.previous.is_some() {
            self.discard(&previous_name(&declared.proxy_name)).await?;
        }

        let result = async {
            self.ensure_networks(&observed.networks).await?;
            let spec = self.run_spec(&candidate, image, artifact, &observed.networks, false);
            self.call("run_container", self.runtime.run_container(&spec)).await?;
            self.wait_ready(&candidate, &artifact.host_ports()).await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = self.discard(&candidate).await {
                warn!(container = %candidate, error = %cleanup, "Failed to remove replacement proxy");
            }
            return Err(e).during("verify", candidate);
        }
        debug!(container = %candidate, "Replacement proxy verified");
        Ok(())
    }

    /// Swap the verified replacement in under the canonical name. On failure
    /// the previous container is put back.
    async fn promote(
        &self,
        proxy: &str,
        observed: &Observation,
        artifact: &GeneratedArtifact,
        image: &BuiltImage,
    ) -> Result<String> {
        let candidate = candidate_name(proxy);
        let previous = previous_name(proxy);
        let mut renamed = false;

        let result = async {
            self.call("stop_container", self.runtime.stop_container(proxy)).await?;
            self.call("rename_container", self.runtime.rename_container(proxy, &previous))
                .await?;
            renamed = true;

            let spec = self.run_spec(proxy, image, artifact, &observed.networks, true);
            let container_id = self.call("run_container", self.runtime.run_container(&spec)).await?;
            self.wait_ready(proxy, &artifact.host_ports()).await?;
            Ok::<_, Error>(container_id)
        }
        .await;

        match result {
            Ok(container_id) => {
                for name in [&previous, &candidate] {
                    if let Err(e) = self.discard(name).await {
                        warn!(container = %name, error = %e, "Failed to remove container after reload");
                    }
                }
                Ok(container_id)
            }
            Err(e) => {
                warn!(proxy, error = %e, "Promotion failed, restoring previous proxy");
                match self.rollback(proxy, renamed).await {
                    Ok(()) => {
                        self.set_lifecycle(Lifecycle::Running);
                        if let Err(cleanup) = self.discard(&candidate).await {
                            warn!(container = %candidate, error = %cleanup, "Failed to remove replacement proxy");
                        }
                        Err(e).during("promote", candidate)
                    }
                    Err(rollback) => {
                        error!(proxy, error = %rollback, "Failed to restore previous proxy");
                        let combined = Error::Runtime {
                            operation: "rollback".to_string(),
                            reason: format!("{}; restoring previous proxy also failed: {}", e, rollback),
                        };
                        self.fail(&combined);
                        Err(combined)
                    }
                }
            }
        }
    }

    async fn rollback(&self, proxy: &str, renamed: bool) -> Result<()> {
        if renamed {
            // whatever holds the canonical name now is the failed replacement
            self.discard(proxy).await?;
            self.call(
                "rename_container",
                self.runtime.rename_container(&previous_name(proxy), proxy),
            )
            .await?;
        }
        self.call("start_container", self.runtime.start_container(proxy)).await?;
        info!(proxy, "Previous proxy restored");
        Ok(())
    }

    /// Poll until `name` is running and accepts connections on every listen
    /// port, for at most `readiness_attempts` checks
    async fn wait_ready(&self, name: &str, ports: &[u16]) -> Result<()> {
        let attempts = self.settings.readiness_attempts;
        let mut waiting_on = None;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.settings.readiness_interval()).await;
            let info = self
                .call("inspect_container", self.runtime.inspect_container(name))
                .await?;
            if !info.running {
                if matches!(info.state.as_str(), "exited" | "dead") {
                    return Err(Error::Runtime {
                        operation: "readiness check".to_string(),
                        reason: format!("container {} exited after start", name),
                    });
                }
                debug!(container = name, attempt, state = %info.state, "Container not running yet");
                continue;
            }

            waiting_on = None;
            for &port in ports {
                let ready = self
                    .call("accepts_connections", self.runtime.accepts_connections(name, port))
                    .await?;
                if !ready {
                    waiting_on = Some(port);
                    break;
                }
            }
            match waiting_on {
                None => return Ok(()),
                Some(port) => {
                    debug!(container = name, attempt, port, "Container not accepting connections yet")
                }
            }
        }

        let reason = match waiting_on {
            Some(port) => format!(
                "container {} not accepting connections on port {} after {} checks",
                name, port, attempts
            ),
            None => format!("container {} not running after {} checks", name, attempts),
        };
        Err(Error::Runtime {
            operation: "readiness check".to_string(),
            reason,
        })
    }

    async fn ensure_image(&self, artifact: &GeneratedArtifact) -> Result<BuiltImage> {
        let current = self.handle.lock().image.clone();
        if let Some(image) = current.filter(|i| i.fingerprint == artifact.fingerprint) {
            debug!(image = %image.tag, "Reusing built image");
            return Ok(image);
        }
        self.build_artifact(artifact).await
    }

    async fn build_artifact(&self, artifact: &GeneratedArtifact) -> Result<BuiltImage> {
        let tag = artifact.image_tag();
        let image_id = with_timeout(
            "build_image",
            self.settings.build_timeout(),
            self.runtime.build_image(&tag, &artifact.build_context),
        )
        .await?;

        let image = BuiltImage {
            tag,
            image_id,
            fingerprint: artifact.fingerprint.clone(),
        };
        info!(image = %image.tag, routes = artifact.routes.len(), "Proxy image built");
        self.handle.lock().image = Some(image.clone());
        Ok(image)
    }

    async fn ensure_networks(&self, networks: &[String]) -> Result<()> {
        for network in networks {
            self.call("ensure_network", self.runtime.ensure_network(network))
                .await
                .during("ensure network", network.as_str())?;
        }
        Ok(())
    }

    async fn remove_leftovers(&self, proxy: &str, observed: &Observation) -> Result<()> {
        if observed.proxy.as_ref().is_some_and(|p| !p.running) {
            debug!(proxy, "Removing stopped proxy container");
            self.discard(proxy).await?;
        }
        if observed.candidate.is_some() {
            self.discard(&candidate_name(proxy)).await?;
        }
        if observed.previous.is_some() {
            self.discard(&previous_name(proxy)).await?;
        }
        Ok(())
    }

    async fn discard(&self, name: &str) -> Result<()> {
        self.call("stop_container", self.runtime.stop_container(name)).await?;
        self.call("remove_container", self.runtime.remove_container(name)).await
    }

    /// First attachable network of a container. An unknown container has none.
    async fn detect_network(&self, name: &str) -> Result<Option<String>> {
        let info = found(self.call("inspect_container", self.runtime.inspect_container(name)).await)?;
        Ok(info.and_then(|info| info.networks.into_iter().find(|n| attachable(n))))
    }

    async fn observe(&self, declared: &DeclaredConfig) -> Result<Observation> {
        let proxy = declared.proxy_name.as_str();
        let containers = self
            .call("list_containers", self.runtime.list_containers(None))
            .await?;

        let mut observed = Observation::default();
        let mut networks: BTreeSet<String> = declared
            .networks()
            .into_iter()
            .filter(|n| attachable(n))
            .collect();
        let routed: BTreeSet<&str> = declared.routes.iter().map(|r| r.target.as_str()).collect();

        let candidate = candidate_name(proxy);
        let previous = previous_name(proxy);
        for info in containers {
            if info.name == proxy {
                observed.proxy = Some(info);
            } else if info.name == candidate {
                observed.candidate = Some(info);
            } else if info.name == previous {
                observed.previous = Some(info);
            } else if info.running && declared.container(&info.name).is_some() {
                // re-detect where routed containers live now
                if routed.contains(info.name.as_str()) {
                    networks.extend(info.networks.iter().filter(|n| attachable(n)).cloned());
                }
                observed.running.insert(info.name);
            }
        }

        networks.remove(&declared.network);
        observed.networks = std::iter::once(declared.network.clone())
            .chain(networks)
            .collect();
        Ok(observed)
    }

    fn generate(&self, declared: &DeclaredConfig, observed: &Observation) -> GeneratedArtifact {
        generate(declared, &observed.running, &self.settings.base_image)
    }

    fn run_spec(
        &self,
        name: &str,
        image: &BuiltImage,
        artifact: &GeneratedArtifact,
        networks: &[String],
        bind_ports: bool,
    ) -> RunSpec {
        let mut labels = BTreeMap::new();
        labels.insert(FINGERPRINT_LABEL.to_string(), artifact.fingerprint.clone());
        labels.insert(PROXY_LABEL.to_string(), artifact.proxy_name.clone());
        RunSpec {
            image: image.tag.clone(),
            name: name.to_string(),
            port_bindings: if bind_ports { artifact.host_ports() } else { Vec::new() },
            networks: networks.to_vec(),
            labels,
        }
    }

    fn require_routes(&self, declared: &DeclaredConfig) -> Result<()> {
        declared.validate()?;
        if declared.routes.is_empty() {
            return Err(Error::Validation(
                "no routes configured; add one with switch".to_string(),
            ));
        }
        Ok(())
    }

    fn restore_declared(&self, original: &DeclaredConfig) {
        match self.store.save(original) {
            Ok(()) => info!("Declared configuration restored"),
            Err(e) => error!(error = %e, "Failed to restore declared configuration"),
        }
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_timeout(operation, self.settings.call_timeout(), call).await
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        let mut handle = self.handle.lock();
        if handle.lifecycle != lifecycle {
            debug!(from = %handle.lifecycle, to = %lifecycle, "Lifecycle transition");
            handle.lifecycle = lifecycle;
        }
        if lifecycle != Lifecycle::Error {
            handle.last_error = None;
        }
    }

    fn fail(&self, err: &Error) {
        let mut handle = self.handle.lock();
        handle.lifecycle = Lifecycle::Error;
        handle.last_error = Some(err.to_string());
    }
}

fn attachable(network: &str) -> bool {
    !UNATTACHABLE_NETWORKS.contains(&network)
}

/// Lifecycle to return to when a reload is abandoned before promotion
fn settled(before: Lifecycle) -> Lifecycle {
    match before {
        Lifecycle::Error => Lifecycle::Error,
        _ => Lifecycle::Running,
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
