//! Device authorization state machine
//!
//! `pending -> authorizing -> complete | error | expired`. Every entry point
//! sweeps stale sessions first and checks expiry lazily, so nothing runs in the
//! background. A callback redeems its `state` under the store lock, then talks
//! to the provider and the identity broker unlocked; the final transition is
//! re-checked under the lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::janitor;
use super::{
    is_expired, normalize_user_code, Clock, DeviceAuthorization, DeviceSession,
    DeviceSessionStore, DeviceStatus, Provider, TokenBundle,
};
use crate::constants::{Urls, POLL_INTERVAL_SECS, SESSION_TTL_SECS};
use crate::oauth::{OAuthSettings, ProviderTokenClient, TokenExchange};

pub use crate::error::DeviceFlowError;

const DEFAULT_FAILURE_MESSAGE: &str = "Authorization failed";

/// What a poll observed while the session is still usable
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Pending { interval: u64 },
    Complete(TokenBundle),
}

/// Query string of a provider redirect back to us
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `path` appended to whatever path prefix the public base URL carries
pub fn url_under(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&format!("{}{}", base.path().trim_end_matches('/'), path));
    url.set_query(None);
    url
}

pub fn callback_uri(base: &Url, provider: Provider) -> Url {
    let path = match provider {
        Provider::Google => Urls::DeviceCallbackGoogle,
        Provider::Github => Urls::DeviceCallbackGithub,
    };
    url_under(base, path.as_str())
}

pub struct DeviceFlow {
    store: Arc<DeviceSessionStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<OAuthSettings>,
    provider_client: Arc<dyn ProviderTokenClient>,
    exchange: Arc<dyn TokenExchange>,
}

impl DeviceFlow {
    pub fn new(
        store: Arc<DeviceSessionStore>,
        clock: Arc<dyn Clock>,
        settings: Arc<OAuthSettings>,
        provider_client: Arc<dyn ProviderTokenClient>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            provider_client,
            exchange,
        }
    }

    pub fn store(&self) -> &Arc<DeviceSessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<OAuthSettings> {
        &self.settings
    }

    pub fn exchange(&self) -> &Arc<dyn TokenExchange> {
        &self.exchange
    }

    async fn sweep(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        janitor::sweep(&self.store, now).await;
        now
    }

    /// Open a new login attempt for `provider`
    pub async fn start(
        &self,
        provider: &str,
        base_url: &Url,
    ) -> Result<DeviceAuthorization, DeviceFlowError> {
        let now = self.sweep().await;
        let provider: Provider = provider
            .parse()
            .map_err(DeviceFlowError::UnsupportedProvider)?;
        if !self.settings.is_configured(provider) {
            return Err(DeviceFlowError::ProviderNotConfigured(provider));
        }

        let session = self.insert_session(provider, now).await;
        debug!(%provider, user_code = %session.user_code, "device session started");

        let verification_uri = url_under(base_url, Urls::DeviceVerify.as_str());
        let mut verification_uri_complete = verification_uri.clone();
        verification_uri_complete
            .query_pairs_mut()
            .append_pair("code", &session.user_code);

        Ok(DeviceAuthorization {
            device_code: session.device_code,
            user_code: session.user_code,
            verification_uri: verification_uri.to_string(),
            verification_uri_complete: verification_uri_complete.to_string(),
            interval: POLL_INTERVAL_SECS,
            expires_in: SESSION_TTL_SECS.unsigned_abs(),
        })
    }

    /// Keep generating secrets until none of the keys clash with a live session
    async fn insert_session(&self, provider: Provider, now: DateTime<Utc>) -> DeviceSession {
        loop {
            let session = DeviceSession::new(provider, now);
            match self.store.create(session.clone()).await {
                Ok(()) => return session,
                Err(conflict) => warn!(?conflict, "device session key collision, regenerating"),
            }
        }
    }

    /// What the CLI sees when it polls. Tokens are handed out once; the
    /// session is gone after any terminal answer.
    pub async fn poll(&self, device_code: &str) -> Result<PollOutcome, DeviceFlowError> {
        let now = self.sweep().await;
        let session = self
            .store
            .get_by_device_code(device_code)
            .await
            .ok_or(DeviceFlowError::NotFound)?;

        if is_expired(&session, now) {
            self.expire(device_code, now).await;
            return Err(DeviceFlowError::Expired);
        }

        match session.status {
            DeviceStatus::Pending | DeviceStatus::Authorizing => Ok(PollOutcome::Pending {
                interval: POLL_INTERVAL_SECS,
            }),
            DeviceStatus::Complete => {
                let tokens = self
                    .store
                    .mutate(device_code, |s| s.tokens.take())
                    .await
                    .flatten();
                self.store.remove(device_code).await;
                tokens
                    .map(PollOutcome::Complete)
                    .ok_or(DeviceFlowError::NotFound)
            }
            DeviceStatus::Error => {
                self.store.remove(device_code).await;
                Err(DeviceFlowError::AuthorizationFailed(
                    session
                        .error
                        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                ))
            }
            DeviceStatus::Expired => {
                self.store.remove(device_code).await;
                Err(DeviceFlowError::Expired)
            }
        }
    }

    /// The human typed a code into the browser; returns where to send them.
    pub async fn submit_user_code(
        &self,
        raw_code: &str,
        base_url: &Url,
    ) -> Result<Url, DeviceFlowError> {
        let now = self.sweep().await;
        let normalized = normalize_user_code(raw_code);
        if normalized.is_empty() {
            return Err(DeviceFlowError::MissingUserCode);
        }
        let device_code = self
            .store
            .get_device_code_by_user_code(&normalized)
            .await
            .ok_or(DeviceFlowError::NotFound)?;

        let outcome = self
            .store
            .mutate(&device_code, |session| {
                if is_expired(session, now) {
                    session.finish(DeviceStatus::Expired, now, None);
                }
                match session.status {
                    DeviceStatus::Pending => {
                        session.status = DeviceStatus::Authorizing;
                        Ok(session.clone())
                    }
                    DeviceStatus::Authorizing if session.state_redeemed => {
                        Err(DeviceFlowError::AlreadyUsed)
                    }
                    DeviceStatus::Authorizing => Ok(session.clone()),
                    DeviceStatus::Complete => Err(DeviceFlowError::AlreadyUsed),
                    DeviceStatus::Expired => Err(DeviceFlowError::Expired),
                    DeviceStatus::Error => Err(DeviceFlowError::AuthorizationFailed(
                        session
                            .error
                            .clone()
                            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                    )),
                }
            })
            .await
            .ok_or(DeviceFlowError::NotFound)?;

        let session = match outcome {
            Ok(session) => session,
            Err(DeviceFlowError::Expired) => {
                self.store.remove(&device_code).await;
                return Err(DeviceFlowError::Expired);
            }
            Err(err) => return Err(err),
        };

        let redirect_uri = callback_uri(base_url, session.provider);
        match self
            .settings
            .authorize_url(session.provider, &redirect_uri, &session.state)
        {
            Ok(url) => {
                info!(provider = %session.provider, "redirecting device login to provider");
                Ok(url)
            }
            Err(err) => {
                self.fail(
                    &device_code,
                    now,
                    format!("{} OAuth not configured", session.provider.display_name()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// The provider sent the browser back. On success the session holds the
    /// broker's tokens until the CLI polls them.
    pub async fn handle_callback(
        &self,
        provider: Provider,
        params: CallbackParams,
        base_url: &Url,
    ) -> Result<(), DeviceFlowError> {
        let now = self.sweep().await;
        let state = non_empty(params.state).ok_or_else(|| {
            DeviceFlowError::InvalidCallback("Missing state parameter".to_string())
        })?;
        let device_code = self
            .store
            .get_device_code_by_state(&state)
            .await
            .ok_or(DeviceFlowError::NotFound)?;
        let provider_error = non_empty(params.error);
        let code = non_empty(params.code);

        // Redeem `state` under the lock before any network call.
        let claim = self
            .store
            .mutate(&device_code, |s| {
                if s.provider != provider {
                    warn!(expected = %s.provider, got = %provider, "callback for the wrong provider");
                    return Err(DeviceFlowError::NotFound);
                }
                if s.status.is_terminal() || s.state_redeemed {
                    return Err(DeviceFlowError::NotFound);
                }
                if is_expired(s, now) {
                    s.finish(DeviceStatus::Expired, now, None);
                    return Err(DeviceFlowError::Expired);
                }
                if let Some(message) = provider_error {
                    warn!(%provider, %message, "provider reported an authorization error");
                    s.finish(DeviceStatus::Error, now, Some(message.clone()));
                    return Err(DeviceFlowError::AuthorizationFailed(message));
                }
                if s.status != DeviceStatus::Authorizing {
                    return Err(DeviceFlowError::NotFound);
                }
                let Some(code) = code else {
                    let message = "Missing authorization code".to_string();
                    s.finish(DeviceStatus::Error, now, Some(message.clone()));
                    return Err(DeviceFlowError::InvalidCallback(message));
                };
                s.state_redeemed = true;
                Ok(code)
            })
            .await
            .ok_or(DeviceFlowError::NotFound)?;

        let code = match claim {
            Ok(code) => code,
            Err(DeviceFlowError::Expired) => {
                self.store.remove(&device_code).await;
                return Err(DeviceFlowError::Expired);
            }
            Err(err) => return Err(err),
        };

        let redirect_uri = callback_uri(base_url, provider);
        let credential = match self
            .provider_client
            .exchange_code(provider, &code, &redirect_uri, &state)
            .await
        {
            Ok(credential) => credential,
            Err(err) => {
                self.fail(&device_code, self.clock.now(), err.to_string())
                    .await;
                return Err(err);
            }
        };

        let bundle = match self.exchange.sign_in_with_idp(provider, &credential).await {
            Ok(bundle) => bundle,
            Err(err) => {
                self.fail(&device_code, self.clock.now(), err.to_string())
                    .await;
                return Err(err);
            }
        };

        // The exchange ran unlocked; the session may have expired meanwhile.
        // An expired session stays in the store so the next poll answers 410.
        let finished_at = self.clock.now();
        let outcome = self
            .store
            .mutate(&device_code, |s| {
                if s.status != DeviceStatus::Authorizing {
                    return Err(DeviceFlowError::NotFound);
                }
                if is_expired(s, finished_at) {
                    s.finish(DeviceStatus::Expired, finished_at, None);
                    return Err(DeviceFlowError::Expired);
                }
                s.complete(bundle, finished_at);
                Ok(())
            })
            .await
            .unwrap_or(Err(DeviceFlowError::NotFound));

        if outcome.is_ok() {
            info!(%provider, "device login complete");
        }
        outcome
    }

    /// Record a failure on a live session so the CLI sees the same message
    async fn fail(&self, device_code: &str, now: DateTime<Utc>, message: String) {
        self.store
            .mutate(device_code, |s| {
                if !s.status.is_terminal() {
                    s.finish(DeviceStatus::Error, now, Some(message));
                }
            })
            .await;
    }

    async fn expire(&self, device_code: &str, now: DateTime<Utc>) {
        self.store
            .mutate(device_code, |s| {
                if !s.status.is_terminal() {
                    s.finish(DeviceStatus::Expired, now, None);
                }
            })
            .await;
        self.store.remove(device_code).await;
    }
}
