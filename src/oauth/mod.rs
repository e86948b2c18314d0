//! OAuth2 authorization-code plumbing for Google and GitHub
pub mod firebase;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::constants::UPSTREAM_TIMEOUT_SECS;
use crate::device::Provider;
use crate::error::{DeviceFlowError, MyError};

pub use firebase::{FirebaseExchange, TokenExchange};

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// OAuth client registration for one provider
#[derive(Clone, Debug)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ProviderCredentials {
    /// Both halves must be present and non-empty
    pub fn from_parts(client_id: Option<String>, client_secret: Option<String>) -> Option<Self> {
        match (client_id, client_secret) {
            (Some(client_id), Some(client_secret))
                if !client_id.is_empty() && !client_secret.is_empty() =>
            {
                Some(Self {
                    client_id,
                    client_secret,
                })
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProviderEndpoints {
    pub authorize_url: Url,
    pub token_url: Url,
}

impl ProviderEndpoints {
    pub fn for_provider(provider: Provider) -> Result<Self, MyError> {
        let (authorize, token) = match provider {
            Provider::Google => (GOOGLE_AUTHORIZE_URL, GOOGLE_TOKEN_URL),
            Provider::Github => (GITHUB_AUTHORIZE_URL, GITHUB_TOKEN_URL),
        };
        Ok(Self {
            authorize_url: Url::parse(authorize)?,
            token_url: Url::parse(token)?,
        })
    }
}

/// Per-provider credentials and endpoints
#[derive(Clone, Debug)]
pub struct OAuthSettings {
    google: Option<ProviderCredentials>,
    github: Option<ProviderCredentials>,
    google_endpoints: ProviderEndpoints,
    github_endpoints: ProviderEndpoints,
}

impl OAuthSettings {
    pub fn new() -> Result<Self, MyError> {
        Ok(Self {
            google: None,
            github: None,
            google_endpoints: ProviderEndpoints::for_provider(Provider::Google)?,
            github_endpoints: ProviderEndpoints::for_provider(Provider::Github)?,
        })
    }

    pub fn with_credentials(
        mut self,
        provider: Provider,
        credentials: Option<ProviderCredentials>,
    ) -> Self {
        match provider {
            Provider::Google => self.google = credentials,
            Provider::Github => self.github = credentials,
        }
        self
    }

    pub fn with_endpoints(mut self, provider: Provider, endpoints: ProviderEndpoints) -> Self {
        match provider {
            Provider::Google => self.google_endpoints = endpoints,
            Provider::Github => self.github_endpoints = endpoints,
        }
        self
    }

    pub fn credentials(&self, provider: Provider) -> Option<&ProviderCredentials> {
        match provider {
            Provider::Google => self.google.as_ref(),
            Provider::Github => self.github.as_ref(),
        }
    }

    pub fn endpoints(&self, provider: Provider) -> &ProviderEndpoints {
        match provider {
            Provider::Google => &self.google_endpoints,
            Provider::Github => &self.github_endpoints,
        }
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.credentials(provider).is_some()
    }

    /// Where the browser goes to grant access. `state` comes back on the callback.
    pub fn authorize_url(
        &self,
        provider: Provider,
        redirect_uri: &Url,
        state: &str,
    ) -> Result<Url, DeviceFlowError> {
        let credentials = self
            .credentials(provider)
            .ok_or(DeviceFlowError::ProviderNotConfigured(provider))?;
        let mut url = self.endpoints(provider).authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &credentials.client_id)
                .append_pair("redirect_uri", redirect_uri.as_str());
            match provider {
                Provider::Google => {
                    query
                        .append_pair("response_type", "code")
                        .append_pair("scope", "openid email profile")
                        .append_pair("state", state)
                        .append_pair("access_type", "offline")
                        .append_pair("prompt", "consent");
                }
                Provider::Github => {
                    query
                        .append_pair("scope", "read:user user:email")
                        .append_pair("state", state)
                        .append_pair("allow_signup", "false");
                }
            }
        }
        Ok(url)
    }
}

/// Token a provider issued for the signed-in user
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderCredential {
    IdToken(String),
    AccessToken(String),
}

impl ProviderCredential {
    /// The `postBody` form the identity broker expects
    pub fn post_body(&self, provider: Provider) -> String {
        let (field, token) = match self {
            ProviderCredential::IdToken(token) => ("id_token", token),
            ProviderCredential::AccessToken(token) => ("access_token", token),
        };
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair(field, token)
            .append_pair("providerId", provider.idp_id())
            .finish()
    }
}

/// Redeems an authorization code at the provider's token endpoint
#[async_trait]
pub trait ProviderTokenClient: Send + Sync {
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &Url,
        state: &str,
    ) -> Result<ProviderCredential, DeviceFlowError>;
}

#[derive(Debug, Deserialize)]
struct ProviderTokenResponse {
    id_token: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Message for a failed upstream call whose body is not the expected JSON
pub(crate) fn body_or_status(body: &str, status: reqwest::StatusCode) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        body.to_string()
    }
}

impl ProviderTokenResponse {
    fn failure(&self) -> Option<String> {
        self.error_description.clone().or_else(|| self.error.clone())
    }
}

pub struct HttpProviderClient {
    http: reqwest::Client,
    settings: Arc<OAuthSettings>,
}

impl HttpProviderClient {
    pub fn new(settings: Arc<OAuthSettings>) -> Result<Self, MyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, settings })
    }
}

#[async_trait]
impl ProviderTokenClient for HttpProviderClient {
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &Url,
        state: &str,
    ) -> Result<ProviderCredential, DeviceFlowError> {
        let credentials = self
            .settings
            .credentials(provider)
            .ok_or(DeviceFlowError::ProviderNotConfigured(provider))?;
        let token_url = self.settings.endpoints(provider).token_url.clone();

        let mut form = vec![
            ("code", code),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ];
        match provider {
            Provider::Google => form.push(("grant_type", "authorization_code")),
            Provider::Github => form.push(("state", state)),
        }

        debug!(%provider, "redeeming authorization code");
        let response = self
            .http
            .post(token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                error!(%provider, error = %err, "failed to reach provider token endpoint");
                DeviceFlowError::ExchangeFailed(format!(
                    "Failed to contact {}: {err}",
                    provider.display_name()
                ))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            DeviceFlowError::ExchangeFailed(format!(
                "Failed to read the {} token response: {err}",
                provider.display_name()
            ))
        })?;
        let body = match serde_json::from_str::<ProviderTokenResponse>(&text) {
            Ok(body) => body,
            Err(err) if status.is_success() => {
                return Err(DeviceFlowError::ExchangeFailed(format!(
                    "{} returned an unreadable token response: {err}",
                    provider.display_name()
                )))
            }
            Err(_) => {
                let reason = body_or_status(&text, status);
                error!(%provider, %status, %reason, "provider token endpoint failed");
                return Err(DeviceFlowError::ExchangeFailed(format!(
                    "{} authorization failed: {reason}",
                    provider.display_name()
                )));
            }
        };

        if !status.is_success() || body.error.is_some() {
            let reason = body.failure().unwrap_or_else(|| status.to_string());
            error!(%provider, %status, %reason, "provider rejected authorization code");
            return Err(DeviceFlowError::ExchangeFailed(format!(
                "{} authorization failed: {reason}",
                provider.display_name()
            )));
        }

        let credential = match provider {
            Provider::Google => body.id_token.map(ProviderCredential::IdToken),
            Provider::Github => body.access_token.map(ProviderCredential::AccessToken),
        };
        credential
            .filter(|c| match c {
                ProviderCredential::IdToken(t) | ProviderCredential::AccessToken(t) => !t.is_empty(),
            })
            .ok_or_else(|| {
                DeviceFlowError::ExchangeFailed(match provider {
                    Provider::Google => "Missing Google ID token".to_string(),
                    Provider::Github => "Missing GitHub access token".to_string(),
                })
            })
    }
}
