use super::GLOBAL_LABELS;
use serde::Deserialize;
use std::net::SocketAddr;

/// Histogram buckets to measure the distribution of request durations in seconds
pub(crate) const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Deserialize)]
struct MetricsConfig {
    #[serde(default = "default_listen_addr")]
    listen_addr: SocketAddr,
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 2000).into()
}

pub fn init_metrics() {
    let config: MetricsConfig = crate::config::from_env_or_panic("METRICS_");

    let mut builder = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .set_buckets(DEFAULT_DURATION_BUCKETS)
        .expect("BUG: invalid default histogram buckets");

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .expect("BUG: failed to initialize the metrics listener");
}
