//! Prometheus metrics for observability
//!
//! Metrics are defined as statics and registered into one process-wide
//! registry on first `gather()`.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Surfaces currently live on any host
    pub static ref SURFACES_LIVE: Gauge =
        Gauge::new("chatvisor_surfaces_live", "Browsing surfaces currently attached").unwrap();

    /// Time to create a surface and load its entry URL
    pub static ref SURFACE_ATTACH_DURATION: Histogram = Histogram::with_opts(histogram_opts!(
        "chatvisor_surface_attach_duration_seconds",
        "Time to attach a browsing surface",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ))
    .unwrap();

    /// Poll cycles by outcome
    pub static ref AGENT_CYCLES: CounterVec = CounterVec::new(
        opts!("chatvisor_agent_cycles_total", "Agent poll cycles by outcome"),
        &["outcome"]
    )
    .unwrap();

    /// Replies submitted by source (rule, ai, heuristic)
    pub static ref REPLIES_SUBMITTED: CounterVec = CounterVec::new(
        opts!("chatvisor_replies_submitted_total", "Replies submitted by source"),
        &["source"]
    )
    .unwrap();

    /// Replies not sent (no_reply, random_skip, rate_limited, submit_failed)
    pub static ref REPLIES_SKIPPED: CounterVec = CounterVec::new(
        opts!("chatvisor_replies_skipped_total", "Replies not sent by reason"),
        &["reason"]
    )
    .unwrap();

    /// Bridge requests by outcome (ok, timeout, transport, status, empty)
    pub static ref BRIDGE_REQUESTS: CounterVec = CounterVec::new(
        opts!("chatvisor_bridge_requests_total", "AI bridge requests by outcome"),
        &["outcome"]
    )
    .unwrap();

    /// Endpoint call latency on the privileged side
    pub static ref BRIDGE_LATENCY: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "chatvisor_bridge_latency_seconds",
            "AI endpoint call latency",
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        ),
        &["model"]
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

fn register<C>(collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = REGISTRY.register(Box::new(collector)) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            tracing::error!(?err, "failed to register metric");
        }
    }
}

/// Register every metric. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        register(SURFACES_LIVE.clone());
        register(SURFACE_ATTACH_DURATION.clone());
        register(AGENT_CYCLES.clone());
        register(REPLIES_SUBMITTED.clone());
        register(REPLIES_SKIPPED.clone());
        register(BRIDGE_REQUESTS.clone());
        register(BRIDGE_LATENCY.clone());
    });
}

/// Render all metrics in Prometheus text format
pub fn gather() -> String {
    register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_counters() {
        REPLIES_SUBMITTED.with_label_values(&["rule"]).inc();
        let text = gather();
        assert!(text.contains("chatvisor_replies_submitted_total"));
    }
}
