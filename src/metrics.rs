// Copyright 2025 Cowboy AI, LLC.

//! Prometheus instrumentation (§13) and the `/metrics` HTTP endpoint that
//! exposes it. The orchestrator and bus consumer already produce this data
//! as part of their own logic (`PostEventCount`/`PostEventDurationSec`,
//! the per-second in-flight gauge); this module just wires it to a
//! concrete exporter.

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::Result;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static POST_EVENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let metric = IntCounterVec::new(
        prometheus::Opts::new("eventbridge_post_event_total", "Event repository dispatch attempts"),
        &["bus", "rule", "result"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(metric.clone())).expect("metric registers once");
    metric
});

static POST_EVENT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let metric = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "eventbridge_post_event_duration_seconds",
            "Wall time of one rule's match+transform+dispatch pass",
        ),
        &["bus", "rule"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(metric.clone())).expect("metric registers once");
    metric
});

static BUS_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    let metric = IntGaugeVec::new(
        prometheus::Opts::new("eventbridge_bus_inflight", "In-flight concurrent-mode consumer deliveries"),
        &["bus", "topic"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(metric.clone())).expect("metric registers once");
    metric
});

static INFORMER_RETRY_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    let metric = IntGaugeVec::new(
        prometheus::Opts::new("eventbridge_informer_retry_queue_depth", "Pending informer retry-scheduler entries"),
        &["reflector"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(metric.clone())).expect("metric registers once");
    metric
});

static DISPATCH_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let metric = IntCounterVec::new(
        prometheus::Opts::new("eventbridge_dispatch_errors_total", "Dispatcher driver send failures"),
        &["target_type"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(metric.clone())).expect("metric registers once");
    metric
});

/// Call once at process start, before any metric-recording code path runs,
/// so the lazily-registered collectors are present in `/metrics` even
/// before their first observation.
pub fn init() {
    Lazy::force(&POST_EVENT_TOTAL);
    Lazy::force(&POST_EVENT_DURATION);
    Lazy::force(&BUS_INFLIGHT);
    Lazy::force(&INFORMER_RETRY_QUEUE_DEPTH);
    Lazy::force(&DISPATCH_ERRORS_TOTAL);
}

/// A scoped timer for one rule's match+transform+dispatch pass; records
/// [`observe_post_event`] on drop via [`PostEventTimer::finish`].
pub struct PostEventTimer {
    bus: String,
    rule: String,
    started: Instant,
}

/// Start timing a `HandleEvent` pass over one rule for one bus.
pub fn start_post_event(bus: &str, rule: &str) -> PostEventTimer {
    PostEventTimer {
        bus: bus.to_string(),
        rule: rule.to_string(),
        started: Instant::now(),
    }
}

impl PostEventTimer {
    /// Record the elapsed duration and the post-event counter in one call.
    pub fn finish(self, result: &str) {
        POST_EVENT_DURATION
            .with_label_values(&[&self.bus, &self.rule])
            .observe(self.started.elapsed().as_secs_f64());
        POST_EVENT_TOTAL.with_label_values(&[&self.bus, &self.rule, result]).inc();
    }
}

/// Sampled every second by a bus's concurrent-mode consumer sidecar.
pub fn set_bus_inflight(bus: &str, topic: &str, count: i64) {
    BUS_INFLIGHT.with_label_values(&[bus, topic]).set(count);
}

/// Sampled by the informer's retry scheduler.
pub fn set_informer_retry_queue_depth(reflector: &str, depth: i64) {
    INFORMER_RETRY_QUEUE_DEPTH.with_label_values(&[reflector]).set(depth);
}

/// Incremented whenever a dispatcher driver's `dispatch` call returns an
/// error (before the orchestrator requeues it to a backoff topic).
pub fn record_dispatch_error(target_type: &str) {
    DISPATCH_ERRORS_TOTAL.with_label_values(&[target_type]).inc();
}

async fn serve_metrics() -> impl IntoResponse {
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
    }
}

/// Bind and serve the `/metrics` endpoint until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(serve_metrics));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::errors::EventBridgeError::Config(format!("binding metrics address {addr}: {e}")))?;
    info!(%addr, "metrics endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::errors::EventBridgeError::Internal(format!("metrics server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_event_timer_records_both_metrics() {
        init();
        let timer = start_post_event("Default", "r1");
        timer.finish("ok");
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"eventbridge_post_event_total"));
        assert!(names.contains(&"eventbridge_post_event_duration_seconds"));
    }

    #[test]
    fn bus_inflight_gauge_is_settable() {
        init();
        set_bus_inflight("Default", "source", 7);
    }
}
