//! Docker binding of the runtime capability interface

use crate::error::{Error, Result};
use crate::nginx::BuildContext;
use crate::runtime::{ContainerInfo, LogStream, NetworkInfo, RunSpec, RuntimeClient};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lines buffered between the log task and the consumer
const LOG_BUFFER: usize = 256;

/// Runtime client backed by a Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
    stop_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(
        docker_host: Option<&str>,
        request_timeout: Duration,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let timeout_secs = request_timeout.as_secs().max(1);
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host, timeout_secs)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, timeout_secs)?
        } else {
            Self::connect_with_defaults(timeout_secs).await?
        };

        client.ping().await.map_err(|e| {
            Error::unavailable(
                "ping",
                format!(
                    "Docker daemon is not responding: {}. Ensure Docker Desktop, Colima, or dockerd is running.",
                    e
                ),
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            stop_timeout,
        })
    }

    fn connect_to_host(host: &str, timeout_secs: u64) -> Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    Error::unavailable(
                        "connect",
                        format!("cannot connect to Unix socket '{}': {}", socket_path, e),
                    )
                })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout_secs, bollard::API_DEFAULT_VERSION).map_err(|e| {
                Error::unavailable(
                    "connect",
                    format!("cannot connect to TCP endpoint '{}': {}", host, e),
                )
            })
        } else {
            Err(Error::Validation(format!(
                "invalid docker_host '{}': expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    async fn connect_with_defaults(timeout_secs: u64) -> Result<Docker> {
        let mut candidates: Vec<(&str, String)> = vec![("Linux default", "/var/run/docker.sock".to_string())];
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(("Docker Desktop", format!("{}/.docker/run/docker.sock", home)));
            candidates.push(("Colima", format!("{}/.colima/default/docker.sock", home)));
            candidates.push(("Rancher Desktop", format!("{}/.rd/docker.sock", home)));
        }
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            candidates.push(("Podman", format!("{}/podman/podman.sock", runtime_dir)));
            candidates.push(("rootless Docker", format!("{}/docker.sock", runtime_dir)));
        }

        let mut tried_paths = Vec::new();

        for (name, path) in &candidates {
            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                    }
                    Err(e) => {
                        tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            let tried_info = if tried_paths.is_empty() {
                "no Docker socket found at common locations".to_string()
            } else {
                format!("tried: {}", tried_paths.join("; "))
            };
            Error::unavailable(
                "connect",
                format!(
                    "cannot connect to Docker daemon ({}); start Docker or set DOCKER_HOST / docker_host: {}",
                    tried_info, e
                ),
            )
        })
    }

    fn container_info_from_inspect(
        name: &str,
        info: bollard::models::ContainerInspectResponse,
    ) -> ContainerInfo {
        let state = info.state.as_ref();
        let running = state.and_then(|s| s.running).unwrap_or(false);
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| if running { "running" } else { "unknown" }.to_string());
        let config = info.config.as_ref();

        let mut networks: Vec<String> = info
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        networks.sort();

        ContainerInfo {
            id: info.id.clone().unwrap_or_default(),
            name: info
                .name
                .as_deref()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            image: config.and_then(|c| c.image.clone()).unwrap_or_default(),
            state: status,
            running,
            networks,
            labels: config
                .and_then(|c| c.labels.clone())
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    fn container_info_from_summary(summary: bollard::models::ContainerSummary) -> Option<ContainerInfo> {
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())?;
        let state = summary.state.map(|s| s.to_string()).unwrap_or_default();

        let mut networks: Vec<String> = summary
            .network_settings
            .and_then(|n| n.networks)
            .map(|n| n.into_keys().collect())
            .unwrap_or_default();
        networks.sort();

        Some(ContainerInfo {
            id: summary.id.unwrap_or_default(),
            name,
            image: summary.image.unwrap_or_default(),
            running: state == "running",
            state,
            networks,
            labels: summary
                .labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error("list_containers", "container", "*", e))?;

        let needle = filter.map(str::to_lowercase);
        let mut containers: Vec<ContainerInfo> = summaries
            .into_iter()
            .filter_map(Self::container_info_from_summary)
            .filter(|c| match &needle {
                Some(needle) => c.name.to_lowercase().contains(needle),
                None => true,
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo> {
        let info = self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect_container", "container", name, e))?;
        Ok(Self::container_info_from_inspect(name, info))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| map_error("list_networks", "network", "*", e))?;

        let mut result = Vec::with_capacity(networks.len());
        for network in networks {
            let Some(name) = network.name.clone() else {
                continue;
            };
            // the list endpoint leaves out attached containers
            let containers = match self
                .client
                .inspect_network(&name, None::<InspectNetworkOptions<String>>)
                .await
            {
                Ok(detail) => detail.containers.map(|c| c.len()).unwrap_or(0),
                Err(e) => {
                    debug!(network = %name, error = %e, "Could not inspect network");
                    network.containers.as_ref().map(|c| c.len()).unwrap_or(0)
                }
            };
            result.push(NetworkInfo {
                id: network.id.unwrap_or_default(),
                name,
                driver: network.driver.unwrap_or_else(|| "unknown".to_string()),
                scope: network.scope.unwrap_or_else(|| "local".to_string()),
                containers,
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn ensure_network(&self, name: &str) -> Result<String> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => {
                debug!(network = name, "Network already exists");
                return Ok(network.id.unwrap_or_default());
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_error("ensure_network", "network", name, e)),
        }

        info!(network = name, "Creating Docker network");
        self.client
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                ..Default::default()
            })
            .await
            .map_err(|e| map_error("create_network", "network", name, e))?;

        let network = self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| map_error("ensure_network", "network", name, e))?;
        Ok(network.id.unwrap_or_default())
    }

    async fn connect(&self, container: &str, network: &str) -> Result<()> {
        let info = self.inspect_container(container).await?;
        if info.networks.iter().any(|n| n == network) {
            debug!(container, network, "Container already connected");
            return Ok(());
        }

        match self
            .client
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container,
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
        {
            Ok(()) => {
                info!(container, network, "Connected container to network");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { message, .. })
                if message.contains("already exists") =>
            {
                debug!(container, network, "Container already connected");
                Ok(())
            }
            Err(e) => Err(map_error("connect", "network", network, e)),
        }
    }

    async fn build_image(&self, tag: &str, context: &BuildContext) -> Result<String> {
        let tar = context.to_tar()?;
        let options = BuildImageOptions::<String> {
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!(tag, "Building proxy image");
        let mut stream = self
            .client
            .build_image(options, None, Some(bytes::Bytes::from(tar)));
        let mut output = Vec::new();

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                        if !line.is_empty() {
                            debug!(tag, "{}", line);
                            output.push(line.to_string());
                        }
                    }
                    if let Some(error) = info.error {
                        output.push(error.clone());
                        return Err(Error::BuildFailed {
                            tag: tag.to_string(),
                            stderr: tail_lines(&output, 20),
                        });
                    }
                }
                Err(e) => {
                    return Err(match map_error("build_image", "image", tag, e) {
                        unavailable @ Error::RuntimeUnavailable { .. } => unavailable,
                        other => {
                            output.push(other.to_string());
                            Error::BuildFailed {
                                tag: tag.to_string(),
                                stderr: tail_lines(&output, 20),
                            }
                        }
                    });
                }
            }
        }

        let image = self
            .client
            .inspect_image(tag)
            .await
            .map_err(|e| map_error("build_image", "image", tag, e))?;
        let id = image.id.unwrap_or_else(|| tag.to_string());
        info!(tag, image_id = %id, "Built proxy image");
        Ok(id)
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.port_bindings {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.networks.first().cloned(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| map_create_error(spec, e))?;
        let container_id = response.id;
        debug!(container = %spec.name, container_id, image = %spec.image, "Created container");

        let started = async {
            for network in spec.networks.iter().skip(1) {
                self.client
                    .connect_network(
                        network,
                        ConnectNetworkOptions {
                            container: spec.name.as_str(),
                            endpoint_config: EndpointSettings::default(),
                        },
                    )
                    .await
                    .map_err(|e| map_error("connect", "network", network, e))?;
            }
            self.client
                .start_container(&spec.name, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| map_error("start_container", "container", &spec.name, e))
        }
        .await;

        if let Err(e) = started {
            // do not leave a half-configured container behind
            if let Err(cleanup) = self.remove_container(&spec.name).await {
                warn!(container = %spec.name, error = %cleanup, "Failed to remove container after failed start");
            }
            return Err(e);
        }

        info!(container = %spec.name, container_id, ports = ?spec.port_bindings, "Started container");
        Ok(container_id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name, "Container was already running");
                Ok(())
            }
            Err(e) => Err(map_error("start_container", "container", name, e)),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };

        match self.client.stop_container(name, Some(options)).await {
            Ok(_) => {
                info!(container = name, "Stopped container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name, "Container was already stopped");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = name, "Container not found");
                Ok(())
            }
            Err(e) => Err(map_error("stop_container", "container", name, e)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => {
                debug!(container = name, "Removed container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = name, "Container not found");
                Ok(())
            }
            Err(e) => Err(map_error("remove_container", "container", name, e)),
        }
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<()> {
        self.client
            .rename_container(name, RenameContainerOptions { name: new_name })
            .await
            .map_err(|e| map_error("rename_container", "container", name, e))?;
        debug!(container = name, new_name, "Renamed container");
        Ok(())
    }

    async fn accepts_connections(&self, name: &str, port: u16) -> Result<bool> {
        let exec = self
            .client
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), listen_check(port)]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_error("accepts_connections", "container", name, e))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_error("accepts_connections", "container", name, e))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                chunk.map_err(|e| map_error("accepts_connections", "container", name, e))?;
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_error("accepts_connections", "container", name, e))?;
        let listening = inspect.exit_code == Some(0);
        debug!(container = name, port, listening, "Checked listen socket");
        Ok(listening)
    }

    async fn stream_logs(&self, name: &str, follow: bool, tail: usize) -> Result<LogStream> {
        // surface NotFound before handing out a stream
        self.inspect_container(name).await?;

        let (sink, stream) = LogStream::channel(LOG_BUFFER);
        let client = self.client.clone();
        let container = name.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                timestamps: false,
                tail: tail.to_string(),
                ..Default::default()
            };

            let mut log_stream = client.logs(&container, Some(options));

            loop {
                tokio::select! {
                    _ = sink.cancelled() => {
                        debug!(container, "Log streaming cancelled");
                        break;
                    }
                    log_result = log_stream.next() => {
                        match log_result {
                            Some(Ok(output)) => {
                                let message = match output {
                                    LogOutput::StdOut { message }
                                    | LogOutput::StdErr { message }
                                    | LogOutput::Console { message } => message,
                                    LogOutput::StdIn { .. } => continue,
                                };
                                let text = String::from_utf8_lossy(&message);
                                for line in text.lines() {
                                    if !sink.send(Ok(line.to_string())).await {
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(container, error = %e, "Error reading container logs");
                                let _ = sink
                                    .send(Err(map_error("stream_logs", "container", &container, e)))
                                    .await;
                                break;
                            }
                            None => {
                                debug!(container, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(stream)
    }
}

fn tail_lines(lines: &[String], count: usize) -> String {
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Shell test for a LISTEN socket (state 0A) on `port` in the container's
/// network namespace
fn listen_check(port: u16) -> String {
    format!(
        "grep -qE ' [0-9A-F]+:{:04X} [0-9A-F]+:[0-9A-F]{{4}} 0A ' /proc/net/tcp /proc/net/tcp6 2>/dev/null",
        port
    )
}

/// A missing image is reported against the image, anything else against the
/// container being created
fn map_create_error(spec: &RunSpec, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => map_error("create_container", "image", &spec.image, err),
        other => map_error("create_container", "container", &spec.name, other),
    }
}

/// Translate a bollard error into the runtime error taxonomy
fn map_error(operation: &str, kind: &'static str, subject: &str, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => classify_response(operation, kind, subject, status_code, &message),
        BollardError::RequestTimeoutError => Error::unavailable(operation, "request to Docker timed out"),
        BollardError::IOError { err } => Error::unavailable(operation, err.to_string()),
        other => {
            let text = other.to_string();
            if is_connection_failure(&text) {
                Error::unavailable(operation, text)
            } else {
                Error::Runtime {
                    operation: operation.to_string(),
                    reason: text,
                }
            }
        }
    }
}

fn classify_response(
    operation: &str,
    kind: &'static str,
    subject: &str,
    status_code: u16,
    message: &str,
) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return Error::PortInUse {
            container: subject.to_string(),
            reason: message.to_string(),
        };
    }
    match status_code {
        404 => Error::not_found(kind, subject),
        409 if lower.contains("already in use") => Error::NameConflict {
            name: subject.to_string(),
        },
        500..=599 if lower.contains("cannot connect") => Error::unavailable(operation, message),
        _ => Error::Runtime {
            operation: operation.to_string(),
            reason: format!("{} (status {})", message, status_code),
        },
    }
}

fn is_connection_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["connection refused", "connection reset", "broken pipe", "no such file", "timed out", "hyper"]
        .iter()
        .any(|needle| lower.contains(needle))
}
