use anyhow::Context;
use clap::{Parser, Subcommand};
use proxy_manager::config::{default_settings_file, Settings};
use proxy_manager::controller::{
    ProxyAfterRemoval, ProxyController, ReloadOutcome, SharedHandle, StartOutcome, StopOutcome,
};
use proxy_manager::declared::{ContainerEntry, Upsert, DEFAULT_PORT};
use proxy_manager::docker::DockerRuntime;
use proxy_manager::status::{ProxyState, StatusReporter};
use proxy_manager::store::{default_config_file, ConfigStore, DynConfigStore, JsonFileStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Manage an Nginx reverse proxy that routes host ports to Docker containers
#[derive(Parser, Debug)]
#[command(name = "proxy-manager", version, about)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Declared configuration document (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Build the proxy image and start the proxy
    Start,

    /// Stop the proxy, or remove the route on PORT and reload
    Stop {
        /// Host port whose route should be removed
        port: Option<u16>,
    },

    /// Stop and start the proxy
    Restart,

    /// Rebuild from the current configuration and replace the running proxy
    Reload,

    /// Build the proxy image without starting it
    Build,

    /// List configured containers
    List,

    /// List Docker networks
    Networks,

    /// Show proxy state and route reachability
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show proxy logs
    Logs {
        /// Keep streaming new lines
        #[arg(short, long)]
        follow: bool,
        /// Number of lines from the end
        #[arg(short = 'n', long, default_value_t = 100)]
        tail: usize,
    },

    /// Add a container to the configuration, or update it
    Add {
        /// Container name
        container: String,
        /// Display label
        label: Option<String>,
        /// Port the container listens on (default: 8000)
        #[arg(short, long)]
        port: Option<u16>,
        /// Network the container is on (default: detected from the container)
        #[arg(short, long)]
        network: Option<String>,
    },

    /// Remove a container and its routes from the configuration
    Remove {
        /// Container name or label
        identifier: String,
    },

    /// Route a host port to a container
    Switch {
        /// Container name or label
        identifier: String,
        /// Host port to route (default: 8000)
        port: Option<u16>,
    },

    /// List Docker containers, optionally filtered by name
    Detect {
        /// Case-insensitive name pattern
        filter: Option<String>,
    },

    /// Show the configuration document
    Config,

    /// Show the nginx.conf the current configuration renders to
    Render,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxy_manager=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings_path = cli.settings.clone().or_else(default_settings_file);
    let settings = Settings::load_or_default(settings_path.as_deref())
        .context("failed to load settings")?;
    settings.validate()?;

    let config_path = match cli.config.clone().or_else(|| settings.config_file.clone()) {
        Some(path) => path,
        None => default_config_file()?,
    };
    debug!(path = %config_path.display(), "Using configuration document");
    let store: DynConfigStore = Arc::new(JsonFileStore::new(config_path));

    match cli.command {
        Cmd::List => list(store.as_ref()),
        Cmd::Config => show_config(store.as_ref()),
        command => {
            let controller = connect(settings, store.clone()).await?;
            run(command, &controller, store.as_ref()).await
        }
    }
}

async fn connect(settings: Settings, store: DynConfigStore) -> anyhow::Result<ProxyController> {
    let runtime = DockerRuntime::connect(
        settings.docker_host.as_deref(),
        settings.call_timeout(),
        settings.stop_timeout(),
    )
    .await?;
    Ok(ProxyController::new(
        Arc::new(runtime),
        store,
        settings,
        SharedHandle::default(),
    ))
}

async fn run(
    command: Cmd,
    controller: &ProxyController,
    store: &dyn ConfigStore,
) -> anyhow::Result<()> {
    match command {
        Cmd::Start => {
            let outcome = controller.start().await?;
            print_start(controller, &outcome)?;
        }
        Cmd::Stop { port: Some(port) } => {
            let removal = controller.remove_route_and_reload(port).await?;
            println!("Removed route: port {}", removal.route.host_port);
            match removal.proxy {
                ProxyAfterRemoval::Reloaded(reload) => print_reload(&reload),
                ProxyAfterRemoval::Stopped(_) => println!("No routes left, proxy stopped"),
                ProxyAfterRemoval::NotRunning => println!("Proxy not running"),
            }
        }
        Cmd::Stop { port: None } => match controller.stop_proxy().await? {
            StopOutcome::Stopped { .. } => println!("Proxy stopped"),
            StopOutcome::NotRunning => println!("Proxy not running"),
        },
        Cmd::Restart => {
            let outcome = controller.restart().await?;
            print_start(controller, &outcome)?;
        }
        Cmd::Reload => {
            println!("Reloading proxy...");
            let outcome = controller.reload().await?;
            print_reload(&outcome);
        }
        Cmd::Build => {
            println!("Building proxy image...");
            let image = controller.build().await?;
            println!("Built image: {}", image.tag);
        }
        Cmd::Networks => networks(&controller.reporter()).await?,
        Cmd::Status { json } => status(&controller.reporter(), json).await?,
        Cmd::Logs { follow, tail } => logs(controller, follow, tail).await?,
        Cmd::Add {
            container,
            label,
            port,
            network,
        } => {
            let entry = ContainerEntry {
                name: container,
                label,
                port,
                network,
            };
            let outcome = controller.add_container(entry).await?;
            if let Some(network) = &outcome.network_hint {
                println!("Auto-detected network: {}", network);
            }
            match outcome.upsert {
                Upsert::Added => println!("Added container: {}", outcome.entry.name),
                Upsert::Updated => println!("Updated container: {}", outcome.entry.name),
            }
        }
        Cmd::Remove { identifier } => {
            let removal = controller.remove_container(&identifier).await?;
            println!("Removed container: {}", removal.entry.name);
            for route in &removal.routes {
                println!("Removed route: port {}", route.host_port);
            }
        }
        Cmd::Switch { identifier, port } => {
            let outcome = controller.switch_route(&identifier, port).await?;
            match &outcome.previous {
                Some(previous) if *previous != outcome.target => println!(
                    "Switched route: {} -> {} (was {})",
                    outcome.host_port, outcome.target, previous
                ),
                Some(_) => println!("Route unchanged: {} -> {}", outcome.host_port, outcome.target),
                None => println!("Added route: {} -> {}", outcome.host_port, outcome.target),
            }
            print_reload(&outcome.reload);
        }
        Cmd::Detect { filter } => {
            let containers = controller.reporter().detect(filter.as_deref()).await?;
            println!("Containers:");
            for detected in containers {
                let marker = if detected.declared { " *" } else { "" };
                println!("  {} ({}){}", detected.info.name, detected.info.state, marker);
            }
        }
        Cmd::Render => {
            let artifact = controller.render().await?;
            print!("{}", artifact.config_text);
        }
        Cmd::List => list(store)?,
        Cmd::Config => show_config(store)?,
    }
    Ok(())
}

fn print_start(controller: &ProxyController, outcome: &StartOutcome) -> anyhow::Result<()> {
    let declared = controller.declared()?;
    match outcome {
        StartOutcome::Started { image, .. } => {
            let ports: Vec<String> = declared.host_ports().iter().map(u16::to_string).collect();
            info!(image = %image.tag, "Proxy container running");
            println!("Proxy started on port(s): {}", ports.join(", "));
        }
        StartOutcome::AlreadyRunning => println!("Proxy already running: {}", declared.proxy_name),
    }
    Ok(())
}

fn print_reload(outcome: &ReloadOutcome) {
    match outcome {
        ReloadOutcome::Started { image, .. } => println!("Proxy started ({})", image.tag),
        ReloadOutcome::Replaced { image, .. } => println!("Proxy reloaded ({})", image.tag),
    }
}

fn list(store: &dyn ConfigStore) -> anyhow::Result<()> {
    let config = store.load()?;
    if config.containers.is_empty() {
        println!("No containers configured");
        return Ok(());
    }

    println!("Configured containers:");
    for container in &config.containers {
        let ports = config.routed_ports(&container.name);
        let marker = match ports.as_slice() {
            [] => String::new(),
            [port] => format!(" (port {})", port),
            ports => format!(
                " (ports {})",
                ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
            ),
        };
        let label = container
            .label
            .as_deref()
            .map(|l| format!(" - {}", l))
            .unwrap_or_default();
        println!(
            "  {}:{}@{}{}{}",
            container.name,
            container.port.unwrap_or(DEFAULT_PORT),
            config.network_of(container),
            label,
            marker
        );
    }
    Ok(())
}

fn show_config(store: &dyn ConfigStore) -> anyhow::Result<()> {
    let config = store.load()?;
    println!("Config file: {}", store.location());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn networks(reporter: &StatusReporter) -> anyhow::Result<()> {
    println!("Available Docker networks:");
    for network in reporter.networks().await? {
        println!(
            "  {:<25} driver={:<10} containers={:<4} scope={:<6} declared={}",
            network.info.name,
            network.info.driver,
            network.info.containers,
            network.info.scope,
            network.declared_containers
        );
    }
    Ok(())
}

async fn status(reporter: &StatusReporter, json: bool) -> anyhow::Result<()> {
    let status = reporter.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if status.state == ProxyState::Absent {
        println!("Proxy not running");
    } else {
        println!("Proxy: {} ({})", status.proxy_name, status.state);
    }
    if let Some(error) = &status.last_error {
        println!("Last error: {}", error);
    }
    if status.running_fingerprint.is_some() && !status.in_sync() {
        println!("Configuration changed since the proxy was built; run reload");
    }

    println!();
    println!("Routes:");
    for route in &status.routes {
        match route.target_port {
            Some(port) => println!(
                "  {} -> {}:{} ({})",
                route.host_port, route.target, port, route.reachability
            ),
            None => println!(
                "  {} -> {} (container not configured)",
                route.host_port, route.target
            ),
        }
    }
    Ok(())
}

async fn logs(controller: &ProxyController, follow: bool, tail: usize) -> anyhow::Result<()> {
    let proxy = controller.declared()?.proxy_name;
    let mut stream = controller.logs(follow, tail).await?;

    println!("Logs for: {}", proxy);
    println!("{}", "-".repeat(50));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                break;
            }
            line = stream.next_line() => match line {
                Some(line) => println!("{}", line?),
                None => break,
            }
        }
    }
    Ok(())
}
