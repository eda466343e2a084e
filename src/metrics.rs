use anyhow::{Context, Result};
use dyngrant_grant_engine::metrics as engine_metrics;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, Registry, TextEncoder};

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        engine_metrics::register_metrics(global_registry());
    });
}

/// Text exposition of every registered collector.
pub fn render_prometheus() -> Result<String> {
    register_metrics();
    let encoder = TextEncoder::new();
    let metric_families = global_registry().gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("failed to encode prometheus metrics")?;
    String::from_utf8(buffer).context("prometheus output is not utf-8")
}
