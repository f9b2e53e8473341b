//! proxy-manager - An Nginx reverse proxy in front of Docker containers
//!
//! This library keeps one Nginx proxy container in line with a small declared
//! configuration:
//! - Declares application containers and host-port routes to them
//! - Renders nginx.conf and a build context from the declared state
//! - Builds and runs the proxy, attached to every network its targets live on
//! - Replaces the running proxy on reload with rollback on failure
//! - Reports per-route reachability and proxy state

pub mod config;
pub mod controller;
pub mod declared;
pub mod docker;
pub mod error;
pub mod nginx;
pub mod runtime;
pub mod status;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::ProxyController;
pub use error::{Error, Result};
