//! Device login handlers: the JSON API the CLI talks to and the pages the browser sees

use askama::Template;
use serde::Deserialize;
use serde_json::json;

use super::prelude::*;
use super::{path_prefix, public_base_url};
use crate::device::flow::CallbackParams;
use crate::device::{DeviceAuthorization, PollOutcome, Provider, TokenBundle};
use crate::error::DeviceFlowError;
use crate::oauth::ProviderCredential;

const COMPLETE_MESSAGE: &str =
    "Authentication complete. You may return to the CLI to finish logging in.";

#[derive(Template)]
#[template(path = "device.html")]
pub(crate) struct DeviceTemplate {
    prefix: String,
    message: Option<String>,
    is_error: bool,
    code: String,
    show_form: bool,
}

impl DeviceTemplate {
    fn form(prefix: String, code: String, error: Option<String>) -> Self {
        Self {
            prefix,
            is_error: error.is_some(),
            message: error,
            code,
            show_form: true,
        }
    }

    fn status(prefix: String, message: String, is_error: bool) -> Self {
        Self {
            prefix,
            message: Some(message),
            is_error,
            code: String::new(),
            show_form: false,
        }
    }
}

/// What the code entry form says when a code is refused
fn submit_message(err: &DeviceFlowError) -> String {
    match err {
        DeviceFlowError::NotFound => "Invalid or expired device code. Please try again.".into(),
        DeviceFlowError::Expired => {
            "Device code has expired. Restart the login from the CLI.".into()
        }
        DeviceFlowError::AlreadyUsed => "This code has already been used. Return to the CLI.".into(),
        other => other.to_string(),
    }
}

/// What the callback page says when the provider round trip did not finish the login
fn callback_message(err: &DeviceFlowError) -> String {
    match err {
        DeviceFlowError::NotFound => {
            "Session not found or expired. Return to the CLI and try again.".into()
        }
        DeviceFlowError::Expired => {
            "Session has expired. Please restart the login from the CLI.".into()
        }
        other => format!("Authentication failed: {other}"),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StartRequest {
    provider: String,
}

#[instrument(level = "info", skip_all)]
pub(crate) async fn device_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<Json<DeviceAuthorization>, Response> {
    let base = public_base_url(&state, &headers).map_err(IntoResponse::into_response)?;
    let authorization = state
        .device_flow
        .start(&request.provider, &base)
        .await
        .map_err(|err| {
            warn!(provider = %request.provider, error = %err, "refused to start device login");
            err.into_response()
        })?;
    Ok(Json(authorization))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PollRequest {
    device_code: String,
}

#[instrument(level = "info", skip_all)]
pub(crate) async fn device_poll(
    State(state): State<AppState>,
    Json(request): Json<PollRequest>,
) -> Response {
    match state.device_flow.poll(&request.device_code).await {
        Ok(PollOutcome::Pending { .. }) => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))).into_response()
        }
        Ok(PollOutcome::Complete(bundle)) => {
            info!(provider = %bundle.provider, "handed tokens to device");
            Json(bundle).into_response()
        }
        Err(err) => {
            debug!(error = %err, "poll did not yield tokens");
            err.into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CodeForm {
    code: Option<String>,
}

#[instrument(level = "info", skip_all)]
pub(crate) async fn device_form(
    State(state): State<AppState>,
    Query(query): Query<CodeForm>,
) -> HtmlTemplate<DeviceTemplate> {
    HtmlTemplate(DeviceTemplate::form(
        path_prefix(&state),
        query.code.unwrap_or_default(),
        None,
    ))
}

#[instrument(level = "info", skip_all)]
pub(crate) async fn device_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CodeForm>,
) -> Response {
    let code = form.code.unwrap_or_default();
    let base = match public_base_url(&state, &headers) {
        Ok(base) => base,
        Err(err) => return err.into_response(),
    };
    match state.device_flow.submit_user_code(&code, &base).await {
        Ok(authorize_url) => (
            StatusCode::FOUND,
            [(header::LOCATION, authorize_url.to_string())],
        )
            .into_response(),
        Err(err) => {
            info!(error = %err, "device code rejected");
            HtmlTemplate(DeviceTemplate::form(
                path_prefix(&state),
                code,
                Some(submit_message(&err)),
            ))
            .into_response()
        }
    }
}

async fn provider_callback(
    state: AppState,
    headers: HeaderMap,
    provider: Provider,
    params: CallbackParams,
) -> Response {
    let base = match public_base_url(&state, &headers) {
        Ok(base) => base,
        Err(err) => return err.into_response(),
    };
    let page = match state
        .device_flow
        .handle_callback(provider, params, &base)
        .await
    {
        Ok(()) => DeviceTemplate::status(path_prefix(&state), COMPLETE_MESSAGE.to_string(), false),
        Err(err) => {
            warn!(%provider, error = %err, "device callback failed");
            DeviceTemplate::status(path_prefix(&state), callback_message(&err), true)
        }
    };
    HtmlTemplate(page).into_response()
}

#[instrument(level = "info", skip_all)]
pub(crate) async fn google_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    provider_callback(state, headers, Provider::Google, params).await
}

#[instrument(level = "info", skip_all)]
pub(crate) async fn github_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    provider_callback(state, headers, Provider::Github, params).await
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProviderLoginRequest {
    provider: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Trade a provider token the client already holds for a broker session
#[instrument(level = "info", skip_all)]
pub(crate) async fn provider_login(
    State(state): State<AppState>,
    Json(request): Json<ProviderLoginRequest>,
) -> Result<Json<TokenBundle>, DeviceFlowError> {
    let provider: Provider = request
        .provider
        .parse()
        .map_err(DeviceFlowError::UnsupportedProvider)?;
    let id_token = request.id_token.filter(|t| !t.is_empty());
    let access_token = request.access_token.filter(|t| !t.is_empty());
    let credential = match (id_token, access_token) {
        (Some(token), _) => ProviderCredential::IdToken(token),
        (None, Some(token)) => ProviderCredential::AccessToken(token),
        (None, None) => return Err(DeviceFlowError::MissingCredential),
    };
    let bundle = state
        .device_flow
        .exchange()
        .sign_in_with_idp(provider, &credential)
        .await?;
    info!(%provider, "provider token login complete");
    Ok(Json(bundle))
}
