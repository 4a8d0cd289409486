#![cfg(feature = "metrics")]

use anyhow::Result;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::{sync::Arc, time::Instant};

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    relay_events_total: IntCounterVec,
    connections_active: IntGauge,
    db_ready: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "parley_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["method", "route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "parley_http_request_duration_seconds",
                "HTTP request latency, labeled by route",
            ),
            &["method", "route"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        let relay_events_total = IntCounterVec::new(
            Opts::new(
                "parley_relay_events_total",
                "Inbound websocket frames handled by the relay, labeled by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(relay_events_total.clone()))?;

        let connections_active = IntGauge::new(
            "parley_websocket_connections_active",
            "Currently open websocket connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let db_ready = IntGauge::new(
            "parley_database_ready",
            "1 when the database connection is established",
        )?;
        registry.register(Box::new(db_ready.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            relay_events_total,
            connections_active,
            db_ready,
        }))
    }

    pub fn record_http(&self, method: &str, route: &str, status: u16, elapsed_secs: f64) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, route, status.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, route])
            .observe(elapsed_secs);
    }

    pub fn record_relay_outcome(&self, outcome: &str) {
        self.relay_events_total.with_label_values(&[outcome]).inc();
    }

    pub fn connection_opened(&self) {
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn set_db_ready(&self, ready: bool) {
        self.db_ready.set(i64::from(ready));
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Route-level middleware; `MatchedPath` is only present on matched routes.
pub async fn track_http(
    State(metrics): State<Arc<MetricsContext>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_owned(), |p| p.as_str().to_owned());
    let started = Instant::now();

    let response = next.run(request).await;
    metrics.record_http(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        let metrics = MetricsContext::init().expect("metrics init");
        metrics.record_http("GET", "/health", 200, 0.002);
        metrics.record_relay_outcome("delivered");
        metrics.connection_opened();
        metrics.set_db_ready(true);

        let body = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(body.contains(
            "parley_http_requests_total{method=\"GET\",route=\"/health\",status=\"200\"} 1"
        ));
        assert!(body.contains("parley_http_request_duration_seconds_count"));
        assert!(body.contains("parley_relay_events_total{outcome=\"delivered\"} 1"));
        assert!(body.contains("parley_websocket_connections_active 1"));
        assert!(body.contains("parley_database_ready 1"));
    }
}
