//! Command line side of the device login: start, show the code, poll, store the tokens.
//! The stored tokens are later checked and refreshed against the identity broker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use url::Url;

use crate::cli::{AccountOpts, LoginOpts, LogoutOpts};
use crate::constants::{Urls, AUTH_FILE_DIR, AUTH_FILE_NAME, UPSTREAM_TIMEOUT_SECS};
use crate::device::flow::url_under;
use crate::device::{DeviceAuthorization, Provider, TokenBundle};
use crate::error::MyError;
use crate::oauth::firebase::{parse_expires_in, IDENTITY_TOOLKIT_URL, SECURE_TOKEN_URL};

/// One answer from the poll endpoint
#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Complete(TokenBundle),
    Expired,
    Failed(String),
}

/// Pull a readable message out of an error body
fn error_text(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value
            .get("detail")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/error/message").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

pub struct DeviceLoginClient {
    http: reqwest::Client,
    api_url: Url,
}

impl DeviceLoginClient {
    pub fn new(api_url: Url) -> Result<Self, MyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, api_url })
    }

    pub async fn start(&self, provider: Provider) -> Result<DeviceAuthorization, MyError> {
        let response = self
            .http
            .post(url_under(&self.api_url, Urls::DeviceStart.as_str()))
            .json(&json!({ "provider": provider }))
            .send()
            .await
            .map_err(|err| MyError::DeviceLogin(format!("Failed to start device login: {err}")))?;

        if !response.status().is_success() {
            let body = response.text().await?;
            return Err(MyError::DeviceLogin(error_text(&body)));
        }
        response.json().await.map_err(|err| {
            MyError::DeviceLogin(format!("Device login response missing required fields: {err}"))
        })
    }

    pub async fn poll(&self, device_code: &str, provider: Provider) -> Result<PollStatus, MyError> {
        let response = self
            .http
            .post(url_under(&self.api_url, Urls::DevicePoll.as_str()))
            .json(&json!({ "device_code": device_code }))
            .send()
            .await
            .map_err(|err| MyError::DeviceLogin(format!("Device polling failed: {err}")))?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(match status {
            202 => PollStatus::Pending,
            200 => {
                let mut tokens: Value = serde_json::from_str(&body)?;
                if let Some(fields) = tokens.as_object_mut() {
                    fields
                        .entry("provider")
                        .or_insert_with(|| json!(provider));
                }
                PollStatus::Complete(serde_json::from_value(tokens)?)
            }
            410 => PollStatus::Expired,
            _ => PollStatus::Failed(error_text(&body)),
        })
    }

    /// Run the whole exchange. `on_start` shows the code to the human.
    pub async fn login<F>(&self, provider: Provider, on_start: F) -> Result<TokenBundle, MyError>
    where
        F: FnOnce(&DeviceAuthorization),
    {
        let authorization = self.start(provider).await?;
        on_start(&authorization);

        let deadline = Instant::now() + Duration::from_secs(authorization.expires_in);
        let interval = Duration::from_secs(authorization.interval);
        loop {
            if Instant::now() >= deadline {
                return Err(MyError::DeviceLogin(
                    "Device authorization timed out.".to_string(),
                ));
            }
            match self.poll(&authorization.device_code, provider).await? {
                PollStatus::Pending => {
                    debug!("authorization pending");
                    sleep(interval).await;
                }
                PollStatus::Complete(tokens) => return Ok(tokens),
                PollStatus::Expired => {
                    return Err(MyError::DeviceLogin(
                        "Device authorization expired. Please start again.".to_string(),
                    ))
                }
                PollStatus::Failed(message) => {
                    return Err(MyError::DeviceLogin(format!(
                        "Device login failed: {message}"
                    )))
                }
            }
        }
    }
}

/// Local token storage
pub struct AuthFile {
    path: PathBuf,
}

impl AuthFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `~/.superbox/auth.json`, or the explicit override
    pub fn resolve(path: Option<PathBuf>) -> Result<Self, MyError> {
        match path {
            Some(path) => Ok(Self::new(path)),
            None => {
                let home = dirs::home_dir().ok_or_else(|| {
                    MyError::Config("Could not determine the home directory".to_string())
                })?;
                Ok(Self::new(home.join(AUTH_FILE_DIR).join(AUTH_FILE_NAME)))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, tokens: &TokenBundle) -> Result<(), MyError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(tokens)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// `None` when there is no file or it is not a token bundle
    pub fn load(&self) -> Option<TokenBundle> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Returns whether there was anything to remove
    pub fn remove(&self) -> Result<bool, MyError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Profile fields from `accounts:lookup`
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub local_id: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<AccountProfile>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<Value>,
    user_id: Option<String>,
}

/// Talks to the identity broker on behalf of an already signed-in user
pub struct AccountClient {
    http: reqwest::Client,
    identity_url: String,
    secure_token_url: String,
    api_key: String,
}

impl AccountClient {
    pub fn new(api_key: String) -> Result<Self, MyError> {
        Self::with_base_urls(IDENTITY_TOOLKIT_URL, SECURE_TOKEN_URL, api_key)
    }

    pub fn with_base_urls(
        identity_url: &str,
        secure_token_url: &str,
        api_key: String,
    ) -> Result<Self, MyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            identity_url: identity_url.trim_end_matches('/').to_string(),
            secure_token_url: secure_token_url.to_string(),
            api_key,
        })
    }

    /// `None` when the broker accepts the token but knows no profile for it
    pub async fn lookup(&self, id_token: &str) -> Result<Option<AccountProfile>, MyError> {
        let response = self
            .http
            .post(format!("{}/accounts:lookup", self.identity_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "idToken": id_token }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MyError::Account(error_text(&body)));
        }
        let lookup: LookupResponse = serde_json::from_str(&body)?;
        Ok(lookup.users.into_iter().next())
    }

    /// New tokens for the same account; fields the broker leaves out are kept
    pub async fn refresh(&self, tokens: &TokenBundle) -> Result<TokenBundle, MyError> {
        let response = self
            .http
            .post(&self.secure_token_url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MyError::Account(format!(
                "Token refresh failed: {}",
                error_text(&body)
            )));
        }
        let refreshed: RefreshResponse = serde_json::from_str(&body)?;
        let id_token = refreshed
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MyError::Account("Token refresh returned no ID token".to_string()))?;

        Ok(TokenBundle {
            id_token,
            refresh_token: refreshed
                .refresh_token
                .unwrap_or_else(|| tokens.refresh_token.clone()),
            expires_in: parse_expires_in(refreshed.expires_in.as_ref()),
            provider: tokens.provider,
            email: tokens.email.clone(),
            local_id: refreshed.user_id.or_else(|| tokens.local_id.clone()),
        })
    }
}

/// Try the prefilled link first, then the bare form
fn open_in_browser(authorization: &DeviceAuthorization) -> bool {
    [
        &authorization.verification_uri_complete,
        &authorization.verification_uri,
    ]
    .into_iter()
    .any(|url| match webbrowser::open(url) {
        Ok(()) => true,
        Err(err) => {
            debug!(%url, error = %err, "could not open browser");
            false
        }
    })
}

pub async fn run_login(opts: LoginOpts) -> Result<(), MyError> {
    let auth_file = AuthFile::resolve(opts.auth_file)?;
    if auth_file.load().is_some() {
        println!("Already logged in. Use 'superbox logout' to switch accounts.");
        return Ok(());
    }
    let client = DeviceLoginClient::new(opts.api_url)?;
    let provider = opts.provider;
    let use_browser = !opts.no_browser;

    let tokens = client
        .login(provider, |authorization| {
            println!("\n=== Device Login ===");
            println!("Provider: {}", provider.display_name());
            println!("User code: {}", authorization.user_code);
            println!("Verification URL: {}", authorization.verification_uri);
            if authorization.verification_uri_complete != authorization.verification_uri {
                println!("Direct link: {}", authorization.verification_uri_complete);
            }
            if use_browser && open_in_browser(authorization) {
                println!("Opened verification page in your browser.");
            } else {
                println!("Open the URL above in your browser and enter the code.");
            }
            println!("Waiting for authorization...");
        })
        .await?;

    auth_file.save(&tokens)?;
    info!(path = %auth_file.path().display(), "saved credentials");
    println!("Login successful.");
    Ok(())
}

fn account_client(api_key: Option<String>) -> Result<AccountClient, MyError> {
    let api_key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
        MyError::Config("FIREBASE_API_KEY is required to talk to the identity broker".to_string())
    })?;
    AccountClient::new(api_key)
}

/// Lines describing the stored login
pub async fn status_report(auth_file: &AuthFile, accounts: &AccountClient) -> Vec<String> {
    let Some(tokens) = auth_file.load() else {
        return vec!["Not logged in.".to_string()];
    };
    match accounts.lookup(&tokens.id_token).await {
        Err(err) => vec![format!("Stored credentials appear invalid: {err}")],
        Ok(None) => vec!["Logged in, but no profile information available.".to_string()],
        Ok(Some(profile)) => {
            let mut lines = vec![
                "Logged in.".to_string(),
                format!("  Email: {}", profile.email.as_deref().unwrap_or("-")),
            ];
            if let Some(name) = profile.display_name {
                lines.push(format!("  Display Name: {name}"));
            }
            lines.push(format!(
                "  User ID: {}",
                profile.local_id.as_deref().unwrap_or("-")
            ));
            lines.push(format!("  Email Verified: {}", profile.email_verified));
            lines.push(format!("  Provider: {}", tokens.provider.display_name()));
            lines
        }
    }
}

/// Swap the stored refresh token for new tokens; returns what to tell the user
pub async fn refresh_stored(
    auth_file: &AuthFile,
    accounts: &AccountClient,
) -> Result<&'static str, MyError> {
    let Some(tokens) = auth_file
        .load()
        .filter(|tokens| !tokens.refresh_token.is_empty())
    else {
        return Ok("No refresh token found. Please login first.");
    };
    let refreshed = accounts.refresh(&tokens).await?;
    auth_file.save(&refreshed)?;
    info!(path = %auth_file.path().display(), "refreshed credentials");
    Ok("Token refreshed.")
}

pub async fn run_status(opts: AccountOpts) -> Result<(), MyError> {
    let auth_file = AuthFile::resolve(opts.auth_file)?;
    let accounts = account_client(opts.firebase_api_key)?;
    for line in status_report(&auth_file, &accounts).await {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_refresh(opts: AccountOpts) -> Result<(), MyError> {
    let auth_file = AuthFile::resolve(opts.auth_file)?;
    let accounts = account_client(opts.firebase_api_key)?;
    println!("{}", refresh_stored(&auth_file, &accounts).await?);
    Ok(())
}

pub fn run_logout(opts: LogoutOpts) -> Result<(), MyError> {
    let auth_file = AuthFile::resolve(opts.auth_file)?;
    if auth_file.remove()? {
        println!("Logged out.");
    } else {
        println!("Not logged in.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn authorization(interval: u64) -> Value {
        json!({
            "device_code": "dev-code",
            "user_code": "ABCD-1234",
            "verification_uri": "http://localhost/api/v1/auth/device",
            "verification_uri_complete": "http://localhost/api/v1/auth/device?code=ABCD-1234",
            "interval": interval,
            "expires_in": 600
        })
    }

    async fn mount_start(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/device/start"))
            .and(body_json(json!({"provider": "github"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(authorization(0)))
            .mount(server)
            .await;
    }

    fn client_for(server: &MockServer) -> DeviceLoginClient {
        DeviceLoginClient::new(Url::parse(&server.uri()).expect("url")).expect("client")
    }

    #[test]
    fn error_text_prefers_detail() {
        assert_eq!(error_text(r#"{"detail": "Unsupported provider 'x'"}"#), "Unsupported provider 'x'");
        assert_eq!(error_text(r#"{"error": {"message": "BAD"}}"#), "BAD");
        assert_eq!(error_text("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn login_polls_until_complete() {
        let server = MockServer::start().await;
        mount_start(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/device/poll"))
            .and(body_json(json!({"device_code": "dev-code"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"status": "pending"})))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/device/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id_token": "id",
                "refresh_token": "refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut shown = None;
        let tokens = client_for(&server)
            .login(Provider::Github, |auth| shown = Some(auth.user_code.clone()))
            .await
            .expect("login");

        assert_eq!(shown.as_deref(), Some("ABCD-1234"));
        assert_eq!(tokens.id_token, "id");
        // the server did not say, so the requested provider is recorded
        assert_eq!(tokens.provider, Provider::Github);
    }

    #[tokio::test]
    async fn expired_login_is_reported() {
        let server = MockServer::start().await;
        mount_start(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/device/poll"))
            .respond_with(
                ResponseTemplate::new(410)
                    .set_body_json(json!({"detail": "Device authorization expired"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .login(Provider::Github, |_| {})
            .await
            .expect_err("expired");
        assert_eq!(
            err.to_string(),
            "Device authorization expired. Please start again."
        );
    }

    #[tokio::test]
    async fn server_error_detail_is_surfaced() {
        let server = MockServer::start().await;
        mount_start(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/device/poll"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"detail": "access_denied"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .login(Provider::Github, |_| {})
            .await
            .expect_err("failed");
        assert_eq!(err.to_string(), "Device login failed: access_denied");
    }

    #[tokio::test]
    async fn start_refusal_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/device/start"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "detail": "GitHub OAuth is not configured on the server"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .start(Provider::Github)
            .await
            .expect_err("refused");
        assert_eq!(
            err.to_string(),
            "GitHub OAuth is not configured on the server"
        );
    }

    fn stored_tokens() -> TokenBundle {
        TokenBundle {
            id_token: "id".into(),
            refresh_token: "refresh".into(),
            expires_in: 3600,
            provider: Provider::Google,
            email: None,
            local_id: Some("uid".into()),
        }
    }

    fn accounts_for(server: &MockServer) -> AccountClient {
        AccountClient::with_base_urls(
            &server.uri(),
            &format!("{}/v1/token", server.uri()),
            "api-key".into(),
        )
        .expect("client")
    }

    #[test]
    fn auth_file_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth_file = AuthFile::new(dir.path().join("nested").join("auth.json"));
        assert!(auth_file.load().is_none());
        assert!(!auth_file.remove().expect("remove"));

        let tokens = stored_tokens();
        auth_file.save(&tokens).expect("save");
        assert_eq!(auth_file.load(), Some(tokens));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(auth_file.path())
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert!(auth_file.remove().expect("remove"));
        assert!(auth_file.load().is_none());
    }

    #[tokio::test]
    async fn status_reports_profile() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:lookup"))
            .and(query_param("key", "api-key"))
            .and(body_json(json!({"idToken": "id"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{
                    "email": "octo@example.com",
                    "displayName": "Octo Cat",
                    "localId": "uid",
                    "emailVerified": true
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let auth_file = AuthFile::new(dir.path().join("auth.json"));
        let accounts = accounts_for(&server);
        assert_eq!(
            status_report(&auth_file, &accounts).await,
            vec!["Not logged in."]
        );

        auth_file.save(&stored_tokens()).expect("save");
        assert_eq!(
            status_report(&auth_file, &accounts).await,
            vec![
                "Logged in.",
                "  Email: octo@example.com",
                "  Display Name: Octo Cat",
                "  User ID: uid",
                "  Email Verified: true",
                "  Provider: Google",
            ]
        );
    }

    #[tokio::test]
    async fn status_flags_rejected_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts:lookup"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": 400, "message": "INVALID_ID_TOKEN"}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let auth_file = AuthFile::new(dir.path().join("auth.json"));
        auth_file.save(&stored_tokens()).expect("save");
        assert_eq!(
            status_report(&auth_file, &accounts_for(&server)).await,
            vec!["Stored credentials appear invalid: INVALID_ID_TOKEN"]
        );
    }

    #[tokio::test]
    async fn refresh_rewrites_the_auth_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .and(query_param("key", "api-key"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id_token": "new-id",
                "refresh_token": "new-refresh",
                "expires_in": "3600",
                "user_id": "uid-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let auth_file = AuthFile::new(dir.path().join("auth.json"));
        let accounts = accounts_for(&server);
        assert_eq!(
            refresh_stored(&auth_file, &accounts).await.expect("refresh"),
            "No refresh token found. Please login first."
        );

        auth_file.save(&stored_tokens()).expect("save");
        assert_eq!(
            refresh_stored(&auth_file, &accounts).await.expect("refresh"),
            "Token refreshed."
        );
        assert_eq!(
            auth_file.load(),
            Some(TokenBundle {
                id_token: "new-id".into(),
                refresh_token: "new-refresh".into(),
                expires_in: 3600,
                provider: Provider::Google,
                email: None,
                local_id: Some("uid-2".into()),
            })
        );
    }

    #[tokio::test]
    async fn refresh_failure_keeps_stored_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": 400, "message": "TOKEN_EXPIRED"}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let auth_file = AuthFile::new(dir.path().join("auth.json"));
        auth_file.save(&stored_tokens()).expect("save");
        let err = refresh_stored(&auth_file, &accounts_for(&server))
            .await
            .expect_err("refresh should fail");
        assert_eq!(err.to_string(), "Token refresh failed: TOKEN_EXPIRED");
        assert_eq!(auth_file.load(), Some(stored_tokens()));
    }
}
