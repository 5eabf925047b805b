//! Integration tests for the reverse-proxy supervisor
//!
//! A small shell script stands in for the proxy binary.

#![cfg(unix)]

use stackgate::config::{ProxyConfig, ServerConfig};
use stackgate::error::ProxyError;
use stackgate::proxy::{render_config, ProxySupervisor};
use stackgate::routes::{ProxyRoute, RouteTable, RouteTableBuilder};
use stackgate::status::{EndpointRecord, ServiceStatus};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Prints its arguments and then blocks until signalled
fn fake_proxy(dir: &TempDir) -> PathBuf {
    write_script(
        dir.path(),
        "fake-proxy",
        "echo \"fake proxy $*\"\necho \"listening\" >&2\nexec sleep 60",
    )
}

fn proxy_config(dir: &TempDir, binary: &Path) -> ProxyConfig {
    ProxyConfig {
        binary: binary.to_string_lossy().into_owned(),
        config_path: dir.path().join("tmp").join("Caddyfile"),
        ports: vec![3010],
        shutdown_grace_period_secs: 2,
        ..Default::default()
    }
}

fn sample_routes() -> RouteTable {
    let status = ServiceStatus {
        api: EndpointRecord::new("127.0.0.1", 54321, ""),
        studio: EndpointRecord::new("127.0.0.1", 54323, ""),
        ..Default::default()
    };
    RouteTableBuilder::new("localhost", &ServerConfig::default()).build(&status)
}

#[tokio::test]
async fn test_setup_and_start_writes_config_and_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_proxy(&dir);
    let config = proxy_config(&dir, &binary);
    let routes = sample_routes();
    let mut proxy = ProxySupervisor::new(config.clone());

    proxy.setup_and_start(&routes, true).await.unwrap();

    assert!(proxy.is_running());
    assert!(proxy.pid().is_some());

    let written = std::fs::read_to_string(&config.config_path).unwrap();
    assert_eq!(written, render_config(&routes, &[3010], true));
    assert!(written.contains("@supabase_api_localhost host supabase-api.localhost"));
    assert!(written.contains("reverse_proxy @supabase_api_localhost 127.0.0.1:54321"));

    proxy.stop().await;
    assert!(!proxy.is_running());
    assert!(proxy.pid().is_none());
}

#[tokio::test]
async fn test_stop_twice_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_proxy(&dir);
    let mut proxy = ProxySupervisor::new(proxy_config(&dir, &binary));

    proxy.setup_and_start(&sample_routes(), false).await.unwrap();

    let start = Instant::now();
    proxy.stop().await;
    proxy.stop().await;

    assert!(!proxy.is_running());
    // SIGTERM is honoured well within the grace period
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_stop_after_process_exited_on_its_own() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "short-proxy", "echo started\nexit 0");
    let mut proxy = ProxySupervisor::new(proxy_config(&dir, &binary));

    proxy.setup_and_start(&sample_routes(), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Still reports running: only the handle is tracked
    assert!(proxy.is_running());

    proxy.stop().await;
    assert!(!proxy.is_running());
}

#[tokio::test]
async fn test_missing_binary_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = proxy_config(&dir, &dir.path().join("no-such-proxy"));
    let mut proxy = ProxySupervisor::new(config.clone());

    let result = proxy.setup_and_start(&sample_routes(), false).await;

    assert!(matches!(result, Err(ProxyError::Spawn { .. })));
    assert!(!proxy.is_running());
    // The configuration is written before the spawn is attempted
    assert!(config.config_path.exists());
}

#[tokio::test]
async fn test_unwritable_config_path_is_write_error() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_proxy(&dir);
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, "").unwrap();

    let config = ProxyConfig {
        config_path: blocker.join("Caddyfile"),
        ..proxy_config(&dir, &binary)
    };
    let mut proxy = ProxySupervisor::new(config);

    let result = proxy.setup_and_start(&sample_routes(), false).await;

    assert!(matches!(result, Err(ProxyError::WriteConfig { .. })));
    assert!(!proxy.is_running());
}

#[tokio::test]
async fn test_shared_subdomain_renders_single_matcher() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_proxy(&dir);
    let config = proxy_config(&dir, &binary);

    let mut routes = RouteTable::new();
    routes.insert("rest", ProxyRoute::new("api.localhost", "localhost:8000/rest", "REST"));
    routes.insert("auth", ProxyRoute::new("api.localhost", "localhost:8000/auth", "Auth"));
    routes.insert("studio", ProxyRoute::new("studio.localhost", "localhost:8001", "Studio"));

    let mut proxy = ProxySupervisor::new(config.clone());
    proxy.setup_and_start(&routes, false).await.unwrap();
    proxy.stop().await;

    let written = std::fs::read_to_string(&config.config_path).unwrap();
    assert_eq!(written.matches(" host api.localhost").count(), 1);
    assert_eq!(written.matches(" host studio.localhost").count(), 1);
    assert_eq!(written.matches("reverse_proxy @api_localhost").count(), 2);
}
