//! Identity broker adapter: trades a provider token for our own session tokens

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use super::{body_or_status, ProviderCredential};
use crate::constants::UPSTREAM_TIMEOUT_SECS;
use crate::device::{Provider, TokenBundle};
use crate::error::{DeviceFlowError, MyError};

pub const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn sign_in_with_idp(
        &self,
        provider: Provider,
        credential: &ProviderCredential,
    ) -> Result<TokenBundle, DeviceFlowError>;

    fn is_configured(&self) -> bool;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<Value>,
    email: Option<String>,
    local_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrokerError {
    error: BrokerErrorBody,
}

#[derive(Debug, Deserialize)]
struct BrokerErrorBody {
    message: String,
}

/// The broker sends `expiresIn` as a decimal string; accept numbers as well.
pub(crate) fn parse_expires_in(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

/// Firebase Identity Toolkit `accounts:signInWithIdp`
pub struct FirebaseExchange {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl FirebaseExchange {
    pub fn new(api_key: Option<String>) -> Result<Self, MyError> {
        Self::with_base_url(IDENTITY_TOOLKIT_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: Option<String>) -> Result<Self, MyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl TokenExchange for FirebaseExchange {
    async fn sign_in_with_idp(
        &self,
        provider: Provider,
        credential: &ProviderCredential,
    ) -> Result<TokenBundle, DeviceFlowError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            DeviceFlowError::ExchangeFailed("Identity broker is not configured".to_string())
        })?;

        let payload = json!({
            "postBody": credential.post_body(provider),
            "requestUri": "http://localhost",
            "returnSecureToken": true,
        });

        debug!(%provider, "exchanging provider token with identity broker");
        let response = self
            .http
            .post(format!("{}/accounts:signInWithIdp", self.base_url))
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                error!(%provider, error = %err, "failed to reach identity broker");
                DeviceFlowError::ExchangeFailed(format!("Failed to contact identity broker: {err}"))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            DeviceFlowError::ExchangeFailed(format!(
                "Failed to read identity broker response: {err}"
            ))
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<BrokerError>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body_or_status(&text, status));
            error!(%provider, %status, %message, "identity broker rejected sign-in");
            return Err(DeviceFlowError::ExchangeFailed(message));
        }

        let parsed: SignInWithIdpResponse = serde_json::from_str(&text).map_err(|err| {
            DeviceFlowError::ExchangeFailed(format!("Identity broker returned invalid JSON: {err}"))
        })?;
        let id_token = parsed
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                DeviceFlowError::ExchangeFailed("Identity broker returned no ID token".to_string())
            })?;

        Ok(TokenBundle {
            id_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            expires_in: parse_expires_in(parsed.expires_in.as_ref()),
            provider,
            email: parsed.email,
            local_id: parsed.local_id,
        })
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}
