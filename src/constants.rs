#[derive(Copy, Clone)]
pub enum Urls {
    Health,
    DeviceStart,
    DevicePoll,
    DeviceVerify,
    DeviceCallbackGoogle,
    DeviceCallbackGithub,
    LoginProvider,
    Stylesheet,
}
impl Urls {
    pub fn as_str(&self) -> &str {
        match self {
            Urls::Health => "/health",
            Urls::DeviceStart => "/api/v1/auth/device/start",
            Urls::DevicePoll => "/api/v1/auth/device/poll",
            Urls::DeviceVerify => "/api/v1/auth/device",
            Urls::DeviceCallbackGoogle => "/api/v1/auth/device/callback/google",
            Urls::DeviceCallbackGithub => "/api/v1/auth/device/callback/github",
            Urls::LoginProvider => "/api/v1/auth/login/provider",
            Urls::Stylesheet => "/static/superbox.css",
        }
    }
}

impl AsRef<str> for Urls {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// How long a device login stays usable, in seconds
pub const SESSION_TTL_SECS: i64 = 600;
/// Suggested wait between CLI polls, in seconds
pub const POLL_INTERVAL_SECS: u64 = 5;
/// How long finished sessions linger before the janitor reaps them, in seconds
pub const TERMINAL_GRACE_SECS: i64 = 120;

pub const DEVICE_CODE_BYTES: usize = 40;
pub const STATE_BYTES: usize = 32;
pub const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Timeout for calls to OAuth providers and the identity broker
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
pub const AUTH_FILE_DIR: &str = ".superbox";
pub const AUTH_FILE_NAME: &str = "auth.json";
