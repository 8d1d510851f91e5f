use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Counts one tunneled user connection for as long as it is alive.
pub struct ActiveConnGuard {
    kind: &'static str,
}

impl ActiveConnGuard {
    pub fn new(kind: &'static str) -> Self {
        metrics::counter!("gangway_user_connections_total", "type" => kind).increment(1);
        metrics::gauge!("gangway_active_user_connections", "type" => kind).increment(1.0);
        Self { kind }
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("gangway_active_user_connections", "type" => self.kind).decrement(1.0);
    }
}

pub fn record_bridged(ingress: u64, egress: u64) {
    metrics::counter!("gangway_bytes_ingress_total").increment(ingress);
    metrics::counter!("gangway_bytes_egress_total").increment(egress);
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
