#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use driftlog::DriftlogConfig;

/// Initialise test logging once per binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftlog=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Reserve a loopback port for a test endpoint
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn connections_toml(peers: &[u16]) -> String {
    let list: Vec<String> = peers
        .iter()
        .map(|port| format!("\"127.0.0.1:{port}\""))
        .collect();
    list.join(", ")
}

/// Endpoint configuration with tight timings suited to loopback tests
pub fn endpoint_config(id: &str, port: u16, peers: &[u16]) -> DriftlogConfig {
    endpoint_config_with_app(id, port, peers, "default", "1.0")
}

/// Endpoint configuration with an explicit application identity
pub fn endpoint_config_with_app(
    id: &str,
    port: u16,
    peers: &[u16],
    application_name: &str,
    application_version: &str,
) -> DriftlogConfig {
    let toml = format!(
        r#"
[endpoint]
id = "{id}"
bind_address = "127.0.0.1:{port}"
connections = [{connections}]

[endpoint.application]
name = "{application_name}"
version = "{application_version}"

[log]
write_batch_size = 16
write_timeout_ms = 5000
read_timeout_ms = 5000

[log.replication]
remote_read_timeout_ms = 1000
remote_scan_limit = 200
retry_delay_ms = 50
failure_detection_limit_ms = 1100

[log.recovery]
remote_operation_retry_max = 5
remote_operation_retry_delay_ms = 50
remote_operation_timeout_ms = 1000
"#,
        connections = connections_toml(peers),
    );
    DriftlogConfig::from_str(&toml).unwrap()
}

/// Endpoint configuration with a long retry delay, so any progress observed
/// within a test must have come from the continue-flag fast path rather than
/// scheduled retries.
pub fn slow_retry_config(id: &str, port: u16, peers: &[u16]) -> DriftlogConfig {
    let toml = format!(
        r#"
[endpoint]
id = "{id}"
bind_address = "127.0.0.1:{port}"
connections = [{connections}]

[log]
write_batch_size = 10

[log.replication]
remote_read_timeout_ms = 1000
remote_scan_limit = 25
retry_delay_ms = 5000
failure_detection_limit_ms = 60000
"#,
        connections = connections_toml(peers),
    );
    DriftlogConfig::from_str(&toml).unwrap()
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
