//! Nginx configuration and image build context generation
//!
//! Pure functions of the declared state and the set of running containers.
//! Identical input always produces byte-identical output, so the fingerprint
//! of an artifact identifies the configuration a proxy container runs.

use crate::declared::DeclaredConfig;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Docker's embedded DNS server, reachable from user-defined networks
pub const DOCKER_RESOLVER: &str = "127.0.0.11";

pub const NGINX_CONF_FILE: &str = "nginx.conf";
pub const DOCKERFILE: &str = "Dockerfile";

/// How a route is rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// Target is declared and running: forward to `name:port`
    Proxy { target: String, port: u16 },
    /// Target is declared but not running: serve the fallback response
    Down { target: String },
    /// Target is not declared: serve the fallback response
    Undeclared { target: String },
}

/// One rendered server block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRoute {
    pub host_port: u16,
    pub upstream: Upstream,
}

/// Files sent to the runtime to build the proxy image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Path inside the context → file content, in stable order
    pub files: BTreeMap<String, String>,
}

impl BuildContext {
    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn dockerfile(&self) -> Option<&str> {
        self.file(DOCKERFILE)
    }

    pub fn nginx_conf(&self) -> Option<&str> {
        self.file(NGINX_CONF_FILE)
    }

    /// Package the context as a tar archive. Headers carry fixed metadata so
    /// equal contexts produce equal archives.
    pub fn to_tar(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            header.set_mtime(0);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .map_err(|e| Error::Runtime {
                    operation: "package build context".to_string(),
                    reason: format!("{}: {}", path, e),
                })?;
        }
        builder.into_inner().map_err(|e| Error::Runtime {
            operation: "package build context".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Everything produced from one declared state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    pub proxy_name: String,
    pub config_text: String,
    pub build_context: BuildContext,
    pub routes: Vec<RenderedRoute>,
    /// SHA-256 of the build context, hex encoded
    pub fingerprint: String,
}

impl GeneratedArtifact {
    /// Image tag derived from the fingerprint
    pub fn image_tag(&self) -> String {
        format!("{}:{}", self.proxy_name, self.short_fingerprint())
    }

    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..12]
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.routes.iter().map(|r| r.host_port).collect()
    }

    /// Routes served by the fallback response
    pub fn fallback_ports(&self) -> Vec<u16> {
        self.routes
            .iter()
            .filter(|r| !matches!(r.upstream, Upstream::Proxy { .. }))
            .map(|r| r.host_port)
            .collect()
    }
}

/// Render the proxy configuration for `declared`, treating containers in
/// `running` as live.
pub fn generate(
    declared: &DeclaredConfig,
    running: &BTreeSet<String>,
    base_image: &str,
) -> GeneratedArtifact {
    let routes: Vec<RenderedRoute> = declared
        .sorted_routes()
        .into_iter()
        .map(|route| {
            let upstream = match declared.container(&route.target) {
                Some(container) if running.contains(&container.name) => Upstream::Proxy {
                    target: container.name.clone(),
                    port: container.effective_port(),
                },
                Some(container) => Upstream::Down {
                    target: container.name.clone(),
                },
                None => Upstream::Undeclared {
                    target: route.target.clone(),
                },
            };
            RenderedRoute {
                host_port: route.host_port,
                upstream,
            }
        })
        .collect();

    let config_text = render_config(&declared.proxy_name, &routes);
    let dockerfile = render_dockerfile(base_image, &routes);

    let mut files = BTreeMap::new();
    files.insert(DOCKERFILE.to_string(), dockerfile);
    files.insert(NGINX_CONF_FILE.to_string(), config_text.clone());
    let build_context = BuildContext { files };
    let fingerprint = fingerprint(&build_context);

    GeneratedArtifact {
        proxy_name: declared.proxy_name.clone(),
        config_text,
        build_context,
        routes,
        fingerprint,
    }
}

fn fingerprint(context: &BuildContext) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in &context.files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn fallback_message(upstream: &Upstream) -> String {
    match upstream {
        Upstream::Undeclared { target } => {
            format!("Service temporarily unavailable - container {} is not configured", target)
        }
        Upstream::Proxy { target, .. } | Upstream::Down { target } => {
            format!("Service temporarily unavailable - container {} is not running", target)
        }
    }
}

fn render_config(proxy_name: &str, routes: &[RenderedRoute]) -> String {
    let mut out = String::new();
    // writing to a String cannot fail
    let _ = writeln!(out, "# Generated by proxy-manager for {}. Do not edit.", proxy_name);
    let _ = writeln!(out, "events {{}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "http {{");
    let _ = writeln!(out, "    resolver {} valid=30s;", DOCKER_RESOLVER);

    for route in routes {
        let _ = writeln!(out);
        render_server(&mut out, route);
    }

    let _ = writeln!(out, "}}");
    out
}

fn render_server(out: &mut String, route: &RenderedRoute) {
    let port = route.host_port;
    let message = fallback_message(&route.upstream);

    let _ = writeln!(out, "    server {{");
    let _ = writeln!(out, "        listen {};", port);
    let _ = writeln!(out);

    match &route.upstream {
        Upstream::Proxy { target, port: target_port } => {
            // variable upstream: resolved per request, so nginx starts even if the name is gone
            let _ = writeln!(out, "        set $backend_addr {}:{};", target, target_port);
            let _ = writeln!(out, "        location / {{");
            let _ = writeln!(out, "            proxy_pass http://$backend_addr;");
            let _ = writeln!(out, "            proxy_set_header Host $host;");
            let _ = writeln!(out, "            proxy_set_header X-Real-IP $remote_addr;");
            let _ = writeln!(
                out,
                "            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
            );
            let _ = writeln!(out, "            proxy_next_upstream error timeout http_502 http_503 http_504;");
            let _ = writeln!(out, "            proxy_intercept_errors on;");
            let _ = writeln!(out, "            error_page 502 503 504 =503 /fallback_{};", port);
            let _ = writeln!(out, "        }}");
            let _ = writeln!(out);
            let _ = writeln!(out, "        location = /fallback_{} {{", port);
            let _ = writeln!(out, "            internal;");
            let _ = writeln!(out, "            default_type text/plain;");
            let _ = writeln!(out, "            return 503 '{}';", message);
            let _ = writeln!(out, "        }}");
        }
        Upstream::Down { .. } | Upstream::Undeclared { .. } => {
            let _ = writeln!(out, "        location / {{");
            let _ = writeln!(out, "            default_type text/plain;");
            let _ = writeln!(out, "            return 503 '{}';", message);
            let _ = writeln!(out, "        }}");
        }
    }

    let _ = writeln!(out, "    }}");
}

fn render_dockerfile(base_image: &str, routes: &[RenderedRoute]) -> String {
    let ports: Vec<String> = routes.iter().map(|r| r.host_port.to_string()).collect();
    let mut out = String::new();
    let _ = writeln!(out, "FROM {}", base_image);
    let _ = writeln!(out, "COPY {} /etc/nginx/nginx.conf", NGINX_CONF_FILE);
    if !ports.is_empty() {
        let _ = writeln!(out, "EXPOSE {}", ports.join(" "));
    }
    let _ = writeln!(out, "CMD [\"nginx\", \"-g\", \"daemon off;\"]");
    out
}
