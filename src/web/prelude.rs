use askama::Template;
pub(crate) use axum::extract::{Query, State};
pub(crate) use axum::http::header;
pub(crate) use axum::response::{Html, IntoResponse, Response};
pub(crate) use axum::{Form, Json};
pub(crate) use http::{HeaderMap, StatusCode};
pub(crate) use tracing::*;

pub(crate) use crate::AppState;

/// Renders an askama template as an HTML response
pub(crate) struct HtmlTemplate<T>(pub(crate) T);

impl<T> IntoResponse for HtmlTemplate<T>
where
    T: Template,
{
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => {
                error!(error = %err, "failed to render page");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
            }
        }
    }
}
