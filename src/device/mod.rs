//! Device authorization sessions
//!
//! A device login pairs a headless CLI (holding the `device_code`) with a browser
//! (where a human types the `user_code`). The types here are shared by the
//! session store, the flow controller and the janitor.

pub mod flow;
pub mod janitor;
pub mod store;

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::constants::{DEVICE_CODE_BYTES, SESSION_TTL_SECS, STATE_BYTES, USER_CODE_ALPHABET};

pub use flow::{DeviceFlow, DeviceFlowError, PollOutcome};
pub use store::DeviceSessionStore;

/// OAuth providers the broker knows how to drive
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Github,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Google, Provider::Github];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Github => "github",
        }
    }

    /// Name shown to humans on the verification pages
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Google => "Google",
            Provider::Github => "GitHub",
        }
    }

    /// Provider id expected by the identity broker
    pub fn idp_id(&self) -> &'static str {
        match self {
            Provider::Google => "google.com",
            Provider::Github => "github.com",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google" => Ok(Provider::Google),
            "github" => Ok(Provider::Github),
            _ => Err(s.to_string()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Authorizing,
    Complete,
    Error,
    Expired,
}

impl DeviceStatus {
    /// Complete, error and expired sessions accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceStatus::Complete | DeviceStatus::Error | DeviceStatus::Expired
        )
    }
}

/// Tokens issued by the identity broker, handed to the CLI exactly once
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

/// What `start` hands back to the CLI
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub interval: u64,
    pub expires_in: u64,
}

/// One in-flight login attempt. Only [`DeviceSessionStore`] holds these;
/// everything else works on clones.
#[derive(Clone, Debug)]
pub struct DeviceSession {
    pub device_code: String,
    pub user_code: String,
    pub normalized_user_code: String,
    pub provider: Provider,
    pub state: String,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens: Option<TokenBundle>,
    pub error: Option<String>,
    /// Set once a callback has taken `state`; the code exchange is then in flight
    pub state_redeemed: bool,
}

impl DeviceSession {
    /// Build a fresh pending session with newly generated secrets
    pub fn new(provider: Provider, now: DateTime<Utc>) -> Self {
        let user_code = generate_user_code();
        Self {
            device_code: generate_device_code(),
            normalized_user_code: normalize_user_code(&user_code),
            user_code,
            provider,
            state: generate_state(),
            status: DeviceStatus::Pending,
            created_at: now,
            expires_at: now + TimeDelta::seconds(SESSION_TTL_SECS),
            completed_at: None,
            tokens: None,
            error: None,
            state_redeemed: false,
        }
    }

    /// Move into a terminal status, stamping `completed_at`.
    pub fn finish(&mut self, status: DeviceStatus, now: DateTime<Utc>, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now);
        if error.is_some() {
            self.error = error;
        }
    }

    /// Store the bundle and mark the session complete
    pub fn complete(&mut self, tokens: TokenBundle, now: DateTime<Utc>) {
        self.tokens = Some(tokens);
        self.finish(DeviceStatus::Complete, now, None);
    }
}

/// A non-terminal session whose TTL has elapsed
pub fn is_expired(session: &DeviceSession, now: DateTime<Utc>) -> bool {
    !session.status.is_terminal() && now >= session.expires_at
}

pub fn generate_device_code() -> String {
    random_token(DEVICE_CODE_BYTES)
}

pub fn generate_state() -> String {
    random_token(STATE_BYTES)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// `XXXX-XXXX` from an uppercase alphanumeric alphabet
pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let raw: String = (0..8)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", &raw[..4], &raw[4..])
}

/// Case, hyphen and whitespace insensitive form used as the lookup key
pub fn normalize_user_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
