use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use url::ParseError;

use crate::device::Provider;

#[derive(Debug)]
pub enum MyError {
    Config(String),
    Http(reqwest::Error),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    DeviceLogin(String),
    Account(String),
}

impl fmt::Display for MyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MyError::Config(msg) => write!(f, "configuration error: {msg}"),
            MyError::Http(err) => write!(f, "request failed: {err}"),
            MyError::Io(err) => write!(f, "io error: {err}"),
            MyError::Serialization(err) => write!(f, "invalid json: {err}"),
            MyError::DeviceLogin(msg) => write!(f, "{msg}"),
            MyError::Account(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MyError {}

impl From<reqwest::Error> for MyError {
    fn from(err: reqwest::Error) -> Self {
        MyError::Http(err)
    }
}
impl From<std::io::Error> for MyError {
    fn from(err: std::io::Error) -> Self {
        MyError::Io(err)
    }
}
impl From<serde_json::Error> for MyError {
    fn from(err: serde_json::Error) -> Self {
        MyError::Serialization(err)
    }
}
impl From<ParseError> for MyError {
    fn from(err: ParseError) -> Self {
        MyError::Config(format!("{:?}", err))
    }
}
impl From<tracing_subscriber::filter::ParseError> for MyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        MyError::Config(format!("invalid log filter: {err}"))
    }
}

/// Failures of the device authorization flow
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceFlowError {
    #[error("Unsupported provider '{0}'")]
    UnsupportedProvider(String),
    #[error("{} OAuth is not configured on the server", .0.display_name())]
    ProviderNotConfigured(Provider),
    #[error("Device code is required")]
    MissingUserCode,
    #[error("Unknown or expired device session")]
    NotFound,
    #[error("Device authorization expired")]
    Expired,
    #[error("This code has already been used")]
    AlreadyUsed,
    #[error("{0}")]
    AuthorizationFailed(String),
    #[error("{0}")]
    ExchangeFailed(String),
    #[error("{0}")]
    InvalidCallback(String),
    #[error("id_token or access_token is required")]
    MissingCredential,
}

impl DeviceFlowError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeviceFlowError::UnsupportedProvider(_)
            | DeviceFlowError::MissingUserCode
            | DeviceFlowError::AlreadyUsed
            | DeviceFlowError::AuthorizationFailed(_)
            | DeviceFlowError::ExchangeFailed(_)
            | DeviceFlowError::InvalidCallback(_)
            | DeviceFlowError::MissingCredential => StatusCode::BAD_REQUEST,
            DeviceFlowError::ProviderNotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeviceFlowError::NotFound => StatusCode::NOT_FOUND,
            DeviceFlowError::Expired => StatusCode::GONE,
        }
    }
}

impl IntoResponse for DeviceFlowError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
