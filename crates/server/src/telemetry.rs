//! Log subscriber setup and per-request HTTP tracing.

use std::time::Duration;

use axum::{body::Body, extract::MatchedPath, http::Request, response::Response};
use tower_http::request_id::RequestId;
use tracing::{
    field::{Field, Visit},
    span, Event, Span, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::{Format, Writer},
        writer::MakeWriter,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::LogFormat;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_FILTER: &str = "info,parley_server=info,parley=info";

/// Installs the global subscriber. `RUST_LOG` wins over the built-in filter.
pub fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if let Err(err) = tracing::subscriber::set_global_default(subscriber(
        format,
        filter,
        std::io::stderr,
    )) {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

/// JSON lines already carry the enclosing span fields, so only the compact
/// format gets the `[request_id=...]` prefix.
pub fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_writer(writer),
            ),
        ),
        LogFormat::Compact => Box::new(
            registry.with(RequestIdLayer).with(
                tracing_subscriber::fmt::layer()
                    .event_format(PrefixRequestId(Format::default().with_target(true)))
                    .with_writer(writer),
            ),
        ),
    }
}

/// Request id captured from a span's `request_id` field.
struct SpanRequestId(String);

#[derive(Default)]
struct RequestIdField(Option<String>);

impl Visit for RequestIdField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.0.is_none() {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer
where
    S: Subscriber + for<'l> LookupSpan<'l>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut field = RequestIdField::default();
        attrs.record(&mut field);
        if let (Some(request_id), Some(span)) = (field.0, ctx.span(id)) {
            span.extensions_mut().insert(SpanRequestId(request_id));
        }
    }
}

/// Prefixes each event with the request id of the nearest enclosing request span.
struct PrefixRequestId<E>(E);

impl<S, N, E> FormatEvent<S, N> for PrefixRequestId<E>
where
    S: Subscriber + for<'l> LookupSpan<'l>,
    N: for<'w> FormatFields<'w> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(scope) = ctx.event_scope() {
            for span in scope {
                if let Some(request_id) = span.extensions().get::<SpanRequestId>() {
                    write!(writer, "[request_id={}] ", request_id.0)?;
                    break;
                }
            }
        }
        self.0.format_event(ctx, writer, event)
    }
}

pub fn http_span(request: &Request<Body>) -> Span {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str)
        .to_owned();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("unknown")
        .to_owned();

    tracing::info_span!(
        "http.request",
        method = %request.method(),
        route = %route,
        request_id = %request_id,
        status_code = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    )
}

pub fn record_response(response: &Response, latency: Duration, span: &Span) {
    let status = response.status().as_u16();
    let latency_ms = latency.as_secs_f64() * 1000.0;
    span.record("status_code", status);
    span.record("latency_ms", latency_ms);
    tracing::debug!(parent: span, status, latency_ms, "request completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing::info;

    /// Shared buffer handed to the subscriber as a writer factory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("lock")).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(format: LogFormat) -> (Box<dyn Subscriber + Send + Sync>, Captured) {
        let captured = Captured::default();
        let writer = {
            let captured = captured.clone();
            move || captured.clone()
        };
        (subscriber(format, EnvFilter::new("debug"), writer), captured)
    }

    fn request_with_id(id: &'static str) -> Request<Body> {
        let mut request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        request
            .extensions_mut()
            .insert(RequestId::new(axum::http::HeaderValue::from_static(id)));
        request
    }

    #[test]
    fn compact_events_inside_request_spans_carry_the_request_id() {
        let (subscriber, captured) = capture(LogFormat::Compact);
        tracing::subscriber::with_default(subscriber, || {
            let span = http_span(&request_with_id("req-42"));
            let _entered = span.enter();
            let nested = tracing::info_span!("relay");
            let _nested = nested.enter();
            info!("inside request");
        });

        let text = captured.text();
        assert!(text.contains("[request_id=req-42]"), "{text}");
        assert!(text.contains("inside request"));
    }

    #[test]
    fn compact_events_outside_requests_are_unprefixed() {
        let (subscriber, captured) = capture(LogFormat::Compact);
        tracing::subscriber::with_default(subscriber, || info!("startup"));

        let text = captured.text();
        assert!(text.contains("startup"));
        assert!(!text.contains("request_id="));
    }

    #[test]
    fn json_lines_include_the_request_span() {
        let (subscriber, captured) = capture(LogFormat::Json);
        tracing::subscriber::with_default(subscriber, || {
            let span = http_span(&request_with_id("req-7"));
            let _entered = span.enter();
            info!("json-output");
        });

        let line = captured.text();
        let parsed: serde_json::Value =
            serde_json::from_str(line.lines().next().expect("one line")).expect("valid json");
        assert_eq!(parsed["fields"]["message"], "json-output");
        assert_eq!(parsed["span"]["request_id"], "req-7");
        assert_eq!(parsed["span"]["route"], "/health");
    }

    #[test]
    fn http_span_falls_back_to_unknown_request_id() {
        let (subscriber, captured) = capture(LogFormat::Compact);
        tracing::subscriber::with_default(subscriber, || {
            let request = Request::builder()
                .uri("/users")
                .body(Body::empty())
                .expect("request");
            let span = http_span(&request);
            let _entered = span.enter();
            info!("anonymous");
        });
        assert!(captured.text().contains("[request_id=unknown]"));
    }
}
