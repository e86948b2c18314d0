//! Tracing setup and the per-request HTTP span

use axum::extract::MatchedPath;
use tower_http::trace::{MakeSpan, OnResponse};
use tracing::field::Empty;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::MyError;

/// Directives for our own crate, the HTTP layer and the upstream client
fn log_filter(log_level: &str, log_level_tower_http: &str) -> String {
    format!(
        "superbox={log_level},tower_http={log_level_tower_http},reqwest={log_level},hyper_util=warn,h2=warn"
    )
}

/// `default_level` applies when `RUST_LOG` is unset; the server runs at
/// `info`, the CLI commands at `warn` so their output stays readable.
pub fn setup_logging(default_level: &str) -> Result<(), MyError> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| default_level.to_string())
        .to_lowercase();
    let log_level_tower_http =
        std::env::var("RUST_LOG_TOWER_HTTP").unwrap_or_else(|_| log_level.clone());

    let format_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(log_level == "debug" || log_level == "trace")
        .with_level(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::builder()
        .parse(log_filter(&log_level, &log_level_tower_http))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    Ok(())
}

#[cfg(test)]
pub(crate) fn setup_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_test_writer()
                .with_level(true),
        )
        .with(tracing_subscriber::EnvFilter::new(
            "superbox=debug,tower_http=debug,wiremock=info,hyper_util=info,h2=warn",
        ))
        .try_init();
}

/// Route template if the router matched one, else the bare path. Never the
/// query string, which carries user codes and OAuth state.
fn request_route<B>(request: &http::Request<B>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

#[derive(Clone)]
pub(crate) struct HttpLogger {}

impl<B> MakeSpan<B> for HttpLogger {
    fn make_span(&mut self, request: &http::Request<B>) -> tracing::Span {
        tracing::info_span!(
            "request",
            http.method = %request.method(),
            http.route = %request_route(request),
            http.status_code = Empty,
            http.response_latency_ms = Empty,
        )
    }
}

impl<B> OnResponse<B> for HttpLogger {
    fn on_response(
        self,
        response: &http::Response<B>,
        latency: std::time::Duration,
        span: &tracing::Span,
    ) {
        let status = response.status();
        let latency_ms = latency.as_millis() as u64;
        span.record("http.status_code", status.as_u16());
        span.record("http.response_latency_ms", latency_ms);

        if status.is_server_error() {
            tracing::warn!(http.status_code = status.as_u16(), http.response_latency_ms = latency_ms);
        } else {
            tracing::info!(http.status_code = status.as_u16(), http.response_latency_ms = latency_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_and_covers_our_crate() {
        let filter = log_filter("info", "debug");
        assert!(filter.starts_with("superbox=info,tower_http=debug"));
        assert!(tracing_subscriber::EnvFilter::builder().parse(filter).is_ok());
    }

    #[test]
    fn route_leaves_out_the_query() {
        let request = http::Request::builder()
            .uri("/api/v1/auth/device/callback/google?code=secret&state=also-secret")
            .body(())
            .expect("request");
        assert_eq!(
            request_route(&request),
            "/api/v1/auth/device/callback/google"
        );
    }
}
