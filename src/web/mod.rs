pub(crate) mod device;
pub(crate) mod prelude;

use std::sync::LazyLock;

use askama::Template;
use axum::middleware::{from_fn, Next};
use axum::{
    routing::{get, post},
    Router,
};
use axum_csp::{CspDirectiveType, CspHeaderBuilder, CspValue};
use http::HeaderValue;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use url::Url;

use crate::constants::Urls;
use crate::device::Provider;
use prelude::*;

pub(crate) fn build_app(shared_state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(crate::logging::HttpLogger {})
        .on_response(crate::logging::HttpLogger {});

    Router::new()
        .route("/", get(root))
        .route(
            Urls::Stylesheet.as_ref(),
            get(|| async {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/css")],
                    include_str!("../static/superbox.css"),
                )
            }),
        )
        .route(Urls::Health.as_ref(), get(health))
        .route(Urls::DeviceStart.as_ref(), post(device::device_start))
        .route(Urls::DevicePoll.as_ref(), post(device::device_poll))
        .route(
            Urls::DeviceVerify.as_ref(),
            get(device::device_form).post(device::device_submit),
        )
        .route(
            Urls::DeviceCallbackGoogle.as_ref(),
            get(device::google_callback),
        )
        .route(
            Urls::DeviceCallbackGithub.as_ref(),
            get(device::github_callback),
        )
        .route(Urls::LoginProvider.as_ref(), post(device::provider_login))
        .fallback(not_found)
        .layer(from_fn(cspheaders_layer))
        .layer(trace_layer)
        .with_state(shared_state)
}

/// Base URL handed out in verification and redirect URIs. The configured
/// public URL wins; otherwise it comes from the proxy headers.
pub(crate) fn public_base_url(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Url, (StatusCode, String)> {
    if let Some(public_url) = &state.public_url {
        return Ok(public_url.clone());
    }
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| *v == "http" || *v == "https")
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    Url::parse(&format!("{scheme}://{host}")).map_err(|err| {
        warn!(%host, error = %err, "unusable Host header");
        (StatusCode::BAD_REQUEST, "Invalid Host header".to_string())
    })
}

/// Path the service is mounted under, without a trailing slash. Empty unless
/// the configured public URL carries a path.
pub(crate) fn path_prefix(state: &AppState) -> String {
    state
        .public_url
        .as_ref()
        .map(|url| url.path().trim_end_matches('/').to_string())
        .unwrap_or_default()
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    prefix: String,
    providers: Vec<&'static str>,
}

#[instrument(level = "info", skip_all)]
async fn root(State(state): State<AppState>) -> HtmlTemplate<IndexTemplate> {
    let settings = state.device_flow.settings();
    HtmlTemplate(IndexTemplate {
        prefix: path_prefix(&state),
        providers: Provider::ALL
            .into_iter()
            .filter(|p| settings.is_configured(*p))
            .map(|p| p.display_name())
            .collect(),
    })
}

#[instrument(level = "debug", skip_all)]
async fn health(State(state): State<AppState>) -> Json<Value> {
    let settings = state.device_flow.settings();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": {
            "google": settings.is_configured(Provider::Google),
            "github": settings.is_configured(Provider::Github),
        },
        "identity_broker": state.device_flow.exchange().is_configured(),
    }))
}

#[derive(Template)]
#[template(path = "404.html")]
pub(crate) struct NotFoundTemplate {
    prefix: String,
}

async fn not_found(State(state): State<AppState>) -> NotFoundTemplate {
    NotFoundTemplate {
        prefix: path_prefix(&state),
    }
}

impl IntoResponse for NotFoundTemplate {
    fn into_response(self) -> Response {
        (
            StatusCode::NOT_FOUND,
            Html(
                self.render()
                    .unwrap_or_else(|_| "404 Not Found".to_string()),
            ),
        )
            .into_response()
    }
}

static CSP_DIRECTIVES: LazyLock<HeaderValue> = LazyLock::new(|| {
    CspHeaderBuilder::new()
        .add(CspDirectiveType::DefaultSrc, vec![CspValue::SelfSite])
        .finish()
});

pub(crate) async fn cspheaders_layer(
    req: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(req).await;

    response.headers_mut().insert(
        axum::http::header::CONTENT_SECURITY_POLICY,
        CSP_DIRECTIVES.clone(),
    );

    Ok(response)
}
