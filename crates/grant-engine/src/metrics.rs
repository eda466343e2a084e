use lazy_static::lazy_static;
use prometheus::{core::Collector, opts, IntCounter, IntCounterVec, Registry};
use tracing::error;

lazy_static! {
    static ref GRANTS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("dyngrant_grants_total", "Grant requests grouped by outcome"),
        &["outcome"]
    )
    .unwrap();
    static ref CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("dyngrant_checks_total", "Permission checks grouped by result"),
        &["result"]
    )
    .unwrap();
    static ref DOMAINS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "dyngrant_domains_created_total",
        "Domain handles created for new execution contexts",
    )
    .unwrap();
    static ref REGISTRY_PRUNED_TOTAL: IntCounter = IntCounter::new(
        "dyngrant_registry_pruned_total",
        "Dead weak registry entries unlinked",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register grant engine metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, GRANTS_TOTAL.clone());
    register(registry, CHECKS_TOTAL.clone());
    register(registry, DOMAINS_CREATED_TOTAL.clone());
    register(registry, REGISTRY_PRUNED_TOTAL.clone());
}

pub fn record_grant(outcome: &str) {
    GRANTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_check(allowed: bool) {
    let result = if allowed { "allow" } else { "deny" };
    CHECKS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_domain_created() {
    DOMAINS_CREATED_TOTAL.inc();
}

pub fn record_pruned(count: usize) {
    REGISTRY_PRUNED_TOTAL.inc_by(count as u64);
}
