//! Integration tests for the proxy controller
//!
//! Drives ProxyController against the in-memory runtime and store: route
//! switching, reload with rollback, stop semantics and status round trips.

use proxy_manager::config::Settings;
use proxy_manager::controller::{
    ProxyAfterRemoval, ProxyController, ReloadOutcome, SharedHandle, StartOutcome, StopOutcome,
    FINGERPRINT_LABEL,
};
use proxy_manager::declared::{ContainerEntry, DeclaredConfig, Upsert};
use proxy_manager::error::Error;
use proxy_manager::status::{ProxyState, Reachability};
use proxy_manager::store::{ConfigStore, MemoryStore};
use proxy_manager::testing::FakeRuntime;
use std::sync::Arc;

struct Harness {
    runtime: Arc<FakeRuntime>,
    store: Arc<MemoryStore>,
    controller: ProxyController,
}

fn settings() -> Settings {
    Settings {
        readiness_attempts: 3,
        readiness_interval_ms: 1,
        ..Settings::default()
    }
}

fn harness(config: DeclaredConfig) -> Harness {
    let runtime = Arc::new(FakeRuntime::new());
    let store = Arc::new(MemoryStore::new(config));
    let controller = ProxyController::new(
        runtime.clone(),
        store.clone(),
        settings(),
        SharedHandle::default(),
    );
    Harness {
        runtime,
        store,
        controller,
    }
}

/// app-v1 and app-v2 declared and running on the proxy network, no routes
fn two_apps() -> Harness {
    let h = harness(DeclaredConfig {
        containers: vec![
            ContainerEntry::new("app-v1").with_port(8000),
            ContainerEntry::new("app-v2").with_port(8080),
        ],
        ..DeclaredConfig::default()
    });
    h.runtime.add_container("app-v1", &["proxy-net"], true);
    h.runtime.add_container("app-v2", &["proxy-net"], true);
    h
}

fn proxy_config(h: &Harness) -> String {
    h.runtime.running_config("proxy-manager").unwrap()
}

// ============================================================================
// Route switching
// ============================================================================

mod switching {
    use super::*;

    #[tokio::test]
    async fn test_switch_then_status_round_trip() {
        let h = two_apps();

        let outcome = h.controller.switch_route("app-v1", None).await.unwrap();
        assert_eq!(outcome.host_port, 8000);
        assert_eq!(outcome.target, "app-v1");
        assert_eq!(outcome.previous, None);
        assert!(matches!(outcome.reload, ReloadOutcome::Started { .. }));

        let status = h.controller.status().await.unwrap();
        assert_eq!(status.state, ProxyState::Running);
        let route = status.route(8000).unwrap();
        assert_eq!(route.target, "app-v1");
        assert_eq!(route.reachability, Reachability::Reachable);
        assert!(status.in_sync());
    }

    #[tokio::test]
    async fn test_app_v1_to_app_v2() {
        let h = two_apps();

        h.controller.switch_route("app-v1", None).await.unwrap();
        assert!(proxy_config(&h).contains("set $backend_addr app-v1:8000;"));
        assert_eq!(h.runtime.ports_of("proxy-manager"), vec![8000]);

        let outcome = h.controller.switch_route("app-v2", Some(8000)).await.unwrap();
        assert_eq!(outcome.previous.as_deref(), Some("app-v1"));
        assert!(matches!(outcome.reload, ReloadOutcome::Replaced { .. }));

        let config = proxy_config(&h);
        assert!(config.contains("set $backend_addr app-v2:8080;"));
        assert!(!config.contains("app-v1:8000"));

        // only the canonical proxy is left behind
        let proxies: Vec<String> = h
            .runtime
            .container_names()
            .into_iter()
            .filter(|n| n.starts_with("proxy-manager"))
            .collect();
        assert_eq!(proxies, vec!["proxy-manager".to_string()]);
        assert_eq!(h.store.snapshot().route(8000).unwrap().target, "app-v2");
    }

    #[tokio::test]
    async fn test_switch_upserts_route() {
        let h = two_apps();

        h.controller.switch_route("app-v1", Some(8000)).await.unwrap();
        h.controller.switch_route("app-v2", Some(8000)).await.unwrap();
        h.controller.switch_route("app-v2", Some(8000)).await.unwrap();

        let declared = h.store.snapshot();
        assert_eq!(declared.routes.len(), 1);
        assert_eq!(declared.route(8000).unwrap().target, "app-v2");
    }

    #[tokio::test]
    async fn test_switch_by_label() {
        let h = two_apps();
        h.controller
            .add_container(ContainerEntry::new("app-v2").with_label("Green"))
            .await
            .unwrap();

        let outcome = h.controller.switch_route("Green", Some(9000)).await.unwrap();
        assert_eq!(outcome.target, "app-v2");
        assert_eq!(h.runtime.ports_of("proxy-manager"), vec![9000]);
    }

    #[tokio::test]
    async fn test_switch_unknown_container_has_no_side_effects() {
        let h = two_apps();

        let err = h.controller.switch_route("app-v3", None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.store.save_count(), 0);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_switches_are_serialized() {
        let h = two_apps();

        let (a, b) = tokio::join!(
            h.controller.switch_route("app-v1", Some(8000)),
            h.controller.switch_route("app-v2", Some(9000)),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(h.store.snapshot().host_ports(), vec![8000, 9000]);
        assert_eq!(h.runtime.ports_of("proxy-manager"), vec![8000, 9000]);
        let status = h.controller.status().await.unwrap();
        assert_eq!(status.state, ProxyState::Running);
    }
}

// ============================================================================
// Reload and rollback
// ============================================================================

mod reload {
    use super::*;

    #[tokio::test]
    async fn test_failing_replacement_leaves_old_proxy_serving() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();
        let before = h.runtime.container("proxy-manager").unwrap();
        let declared_before = h.store.snapshot();

        h.runtime.crash_on_start("proxy-manager-next");
        let err = h.controller.switch_route("app-v2", None).await.unwrap_err();
        assert!(matches!(err.root(), Error::ReloadFailed { .. }));

        // declared state rolled back with the proxy
        assert_eq!(h.store.snapshot(), declared_before);

        let after = h.runtime.container("proxy-manager").unwrap();
        assert!(after.running);
        assert_eq!(after.id, before.id);
        assert_eq!(after.labels.get(FINGERPRINT_LABEL), before.labels.get(FINGERPRINT_LABEL));
        assert!(proxy_config(&h).contains("app-v1:8000"));
        assert!(h.runtime.container("proxy-manager-next").is_none());

        let status = h.controller.status().await.unwrap();
        assert_eq!(status.state, ProxyState::Running);
    }

    #[tokio::test]
    async fn test_failed_promotion_restores_previous_proxy() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();
        let before = h.runtime.container("proxy-manager").unwrap();

        h.runtime.fail_run("proxy-manager");
        let err = h.controller.switch_route("app-v2", None).await.unwrap_err();
        assert!(matches!(err.root(), Error::ReloadFailed { .. }));

        let restored = h.runtime.container("proxy-manager").unwrap();
        assert!(restored.running);
        assert_eq!(restored.id, before.id);
        assert_eq!(h.runtime.ports_of("proxy-manager"), vec![8000]);
        assert!(h.runtime.container("proxy-manager-prev").is_none());
        assert!(h.runtime.container("proxy-manager-next").is_none());
        assert_eq!(h.store.snapshot().route(8000).unwrap().target, "app-v1");
    }

    #[tokio::test]
    async fn test_reload_picks_up_started_target() {
        let h = two_apps();
        h.runtime.set_running("app-v2", false);
        h.controller.switch_route("app-v2", None).await.unwrap();
        assert!(proxy_config(&h).contains("container app-v2 is not running"));

        h.runtime.set_running("app-v2", true);
        let outcome = h.controller.reload().await.unwrap();
        let ReloadOutcome::Replaced {
            previous_fingerprint,
            image,
            ..
        } = outcome
        else {
            panic!("expected the live proxy to be replaced");
        };
        assert_ne!(previous_fingerprint.as_deref(), Some(image.fingerprint.as_str()));
        assert!(proxy_config(&h).contains("set $backend_addr app-v2:8080;"));
    }

    #[tokio::test]
    async fn test_reload_attaches_detected_networks() {
        let h = harness(DeclaredConfig {
            containers: vec![ContainerEntry::new("api").with_port(3000)],
            ..DeclaredConfig::default()
        });
        h.runtime.add_container("api", &["backend"], true);

        h.controller.switch_route("api", None).await.unwrap();
        let proxy = h.runtime.container("proxy-manager").unwrap();
        assert_eq!(proxy.networks, vec!["proxy-net".to_string(), "backend".to_string()]);
    }

    #[tokio::test]
    async fn test_replacement_not_accepting_connections_is_not_promoted() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();
        let before = h.runtime.container("proxy-manager").unwrap();

        h.runtime.refuse_connections("proxy-manager-next");
        let err = h.controller.switch_route("app-v2", None).await.unwrap_err();
        assert!(matches!(err.root(), Error::ReloadFailed { .. }));
        assert!(err.to_string().contains("not accepting connections on port 8000"));

        let after = h.runtime.container("proxy-manager").unwrap();
        assert!(after.running);
        assert_eq!(after.id, before.id);
        assert!(h.runtime.container("proxy-manager-next").is_none());
        assert_eq!(h.store.snapshot().route(8000).unwrap().target, "app-v1");

        h.runtime.clear_refusals();
        h.controller.switch_route("app-v2", None).await.unwrap();
        assert!(proxy_config(&h).contains("app-v2:8080"));
    }

    #[tokio::test]
    async fn test_host_and_bridge_networks_are_never_joined() {
        let h = harness(DeclaredConfig::default());
        h.runtime.add_container("legacy", &["bridge"], true);
        h.runtime.add_container("hosty", &["host"], true);

        let legacy = h.controller.add_container(ContainerEntry::new("legacy")).await.unwrap();
        let hosty = h.controller.add_container(ContainerEntry::new("hosty")).await.unwrap();
        assert_eq!(legacy.network_hint, None);
        assert_eq!(hosty.network_hint, None);

        // hand-declared networks are filtered too
        let mut declared = h.store.snapshot();
        declared.upsert_container(ContainerEntry::new("hosty").with_network("host"));
        h.store.save(&declared).unwrap();

        h.controller.switch_route("legacy", None).await.unwrap();
        let proxy = h.runtime.container("proxy-manager").unwrap();
        assert!(proxy.running);
        assert_eq!(proxy.networks, vec!["proxy-net".to_string()]);
    }

    #[tokio::test]
    async fn test_reload_without_routes_is_rejected() {
        let h = two_apps();
        let err = h.controller.reload().await.unwrap_err();
        assert!(matches!(err.root(), Error::Validation(_)));
        assert!(h.runtime.calls().is_empty());
    }
}

// ============================================================================
// Start and stop
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = two_apps();
        let mut declared = h.store.snapshot();
        declared.upsert_route(8000, "app-v1");
        h.store.save(&declared).unwrap();

        assert!(matches!(h.controller.start().await.unwrap(), StartOutcome::Started { .. }));
        assert_eq!(h.controller.start().await.unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(h.runtime.image_tags().len(), 1);
    }

    #[tokio::test]
    async fn test_start_reports_drift() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();

        let mut declared = h.store.snapshot();
        declared.upsert_route(9000, "app-v2");
        h.store.save(&declared).unwrap();

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, Error::ConfigDrift { .. }));
        assert!(err.to_string().contains("run reload"));

        h.controller.reload().await.unwrap();
        assert_eq!(h.controller.start().await.unwrap(), StartOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_start_removes_stopped_leftover() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();
        h.runtime.set_running("proxy-manager", false);

        assert!(matches!(h.controller.start().await.unwrap(), StartOutcome::Started { .. }));
        assert!(h.runtime.container("proxy-manager").unwrap().running);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();

        let first = h.controller.stop_proxy().await.unwrap();
        assert_eq!(
            first,
            StopOutcome::Stopped {
                removed: vec!["proxy-manager".to_string()]
            }
        );
        assert_eq!(h.controller.stop_proxy().await.unwrap(), StopOutcome::NotRunning);
        assert!(h.controller.handle().lock().image.is_none());
        assert_eq!(h.controller.status().await.unwrap().state, ProxyState::Absent);
    }

    #[tokio::test]
    async fn test_port_conflict_leaves_error_state() {
        let h = two_apps();
        h.runtime.occupy_port(8000);

        let err = h.controller.switch_route("app-v1", None).await.unwrap_err();
        assert!(matches!(err.root(), Error::PortInUse { .. }));
        assert_eq!(h.controller.status().await.unwrap().state, ProxyState::Error);

        // only stop, reload, restart, build and route removal are accepted now
        h.runtime.release_port(8000);
        let mut declared = h.store.snapshot();
        declared.upsert_route(8000, "app-v1");
        h.store.save(&declared).unwrap();
        assert!(matches!(h.controller.start().await.unwrap_err(), Error::InvalidState { .. }));

        assert!(matches!(h.controller.reload().await.unwrap(), ReloadOutcome::Started { .. }));
        assert_eq!(h.controller.status().await.unwrap().state, ProxyState::Running);
    }

    #[tokio::test]
    async fn test_unavailable_runtime_is_retryable() {
        let h = two_apps();
        let mut declared = h.store.snapshot();
        declared.upsert_route(8000, "app-v1");
        h.store.save(&declared).unwrap();
        h.runtime.set_unavailable(true);

        let err = h.controller.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("start proxy proxy-manager"));

        h.runtime.set_unavailable(false);
        assert!(matches!(h.controller.start().await.unwrap(), StartOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn test_build_failure_is_reported_with_output() {
        let h = two_apps();
        let mut declared = h.store.snapshot();
        declared.upsert_route(8000, "app-v1");
        h.store.save(&declared).unwrap();
        h.runtime.fail_builds(Some("nginx: [emerg] unknown directive"));

        let err = h.controller.start().await.unwrap_err();
        match err.root() {
            Error::BuildFailed { stderr, .. } => assert!(stderr.contains("unknown directive")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.runtime.container("proxy-manager").is_none());
        assert_eq!(h.controller.status().await.unwrap().state, ProxyState::Absent);
    }
}

// ============================================================================
// Route and container removal
// ============================================================================

mod removal {
    use super::*;

    #[tokio::test]
    async fn test_stop_port_removes_route_entirely() {
        let h = two_apps();
        h.controller.switch_route("app-v1", Some(8000)).await.unwrap();
        h.controller.switch_route("app-v2", Some(9000)).await.unwrap();

        let removal = h.controller.remove_route_and_reload(8000).await.unwrap();
        assert_eq!(removal.route.target, "app-v1");
        assert!(matches!(removal.proxy, ProxyAfterRemoval::Reloaded(_)));

        assert!(h.store.snapshot().route(8000).is_none());
        assert_eq!(h.runtime.ports_of("proxy-manager"), vec![9000]);
        assert!(!proxy_config(&h).contains("listen 8000;"));
        assert!(h.controller.status().await.unwrap().route(8000).is_none());
    }

    #[tokio::test]
    async fn test_removing_last_route_stops_proxy() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();

        let removal = h.controller.remove_route_and_reload(8000).await.unwrap();
        assert!(matches!(removal.proxy, ProxyAfterRemoval::Stopped(_)));
        assert!(h.runtime.container("proxy-manager").is_none());
        assert!(h.store.snapshot().routes.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_route_is_not_found() {
        let h = two_apps();
        let err = h.controller.remove_route_and_reload(8123).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_reload_restores_removed_route() {
        let h = two_apps();
        h.controller.switch_route("app-v1", Some(8000)).await.unwrap();
        h.controller.switch_route("app-v2", Some(9000)).await.unwrap();

        h.runtime.crash_on_start("proxy-manager-next");
        let err = h.controller.remove_route_and_reload(8000).await.unwrap_err();
        assert!(matches!(err.root(), Error::ReloadFailed { .. }));
        assert_eq!(h.store.snapshot().host_ports(), vec![8000, 9000]);
        assert_eq!(h.runtime.ports_of("proxy-manager"), vec![8000, 9000]);
    }

    #[tokio::test]
    async fn test_remove_container_drops_routes_without_reload() {
        let h = two_apps();
        h.controller.switch_route("app-v1", Some(8000)).await.unwrap();
        h.controller.switch_route("app-v1", Some(8001)).await.unwrap();
        h.runtime.clear_calls();

        let removal = h.controller.remove_container("app-v1").await.unwrap();
        assert_eq!(removal.routes.len(), 2);
        assert!(h.store.snapshot().routes.is_empty());
        assert!(h.runtime.calls().is_empty());

        let err = h.controller.remove_container("app-v1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_add_container_fails_when_runtime_unavailable() {
        let h = two_apps();
        h.runtime.set_unavailable(true);

        let err = h
            .controller
            .add_container(ContainerEntry::new("app-v3"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("add container app-v3"));
        assert!(h.store.snapshot().container("app-v3").is_none());
    }

    #[tokio::test]
    async fn test_add_container_twice_updates() {
        let h = two_apps();
        let first = h
            .controller
            .add_container(ContainerEntry::new("app-v3").with_port(7000))
            .await
            .unwrap();
        assert_eq!(first.upsert, Upsert::Added);

        let second = h
            .controller
            .add_container(ContainerEntry::new("app-v3").with_label("Canary"))
            .await
            .unwrap();
        assert_eq!(second.upsert, Upsert::Updated);
        assert_eq!(second.entry.port, Some(7000));
        assert_eq!(second.entry.label.as_deref(), Some("Canary"));
        assert_eq!(h.store.snapshot().containers.len(), 3);
    }
}

// ============================================================================
// Fallback and logs
// ============================================================================

mod fallback {
    use super::*;

    #[tokio::test]
    async fn test_stopped_target_is_served_by_fallback() {
        let h = two_apps();
        h.runtime.set_running("app-v2", false);

        h.controller.switch_route("app-v1", Some(8000)).await.unwrap();
        h.controller.switch_route("app-v2", Some(9000)).await.unwrap();

        let config = proxy_config(&h);
        assert!(config.contains("return 503 'Service temporarily unavailable - container app-v2 is not running';"));

        let status = h.controller.status().await.unwrap();
        assert_eq!(status.state, ProxyState::Degraded);
        assert_eq!(status.route(9000).unwrap().reachability, Reachability::Unreachable);
        assert_eq!(status.route(8000).unwrap().reachability, Reachability::Reachable);
    }

    #[tokio::test]
    async fn test_render_is_deterministic() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();

        let a = h.controller.render().await.unwrap();
        let b = h.controller.render().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(Some(a.config_text), h.runtime.running_config("proxy-manager"));
    }

    #[tokio::test]
    async fn test_logs_stream_proxy_output() {
        let h = two_apps();
        h.controller.switch_route("app-v1", None).await.unwrap();
        h.runtime.push_log("proxy-manager", "GET / 200");
        h.runtime.push_log("proxy-manager", "GET /health 200");

        let mut stream = h.controller.logs(false, 1).await.unwrap();
        assert_eq!(stream.next_line().await.unwrap().unwrap(), "GET /health 200");
        assert!(stream.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_logs_without_proxy_is_not_found() {
        let h = two_apps();
        let err = h.controller.logs(false, 10).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
