//! Command line and environment configuration

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::constants::DEFAULT_LISTEN_ADDR;
use crate::device::Provider;
use crate::error::MyError;
use crate::oauth::{OAuthSettings, ProviderCredentials};

#[derive(Parser, Debug)]
#[command(version, about = "Superbox device login broker")]
pub struct CliOpts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker
    Serve(ServeOpts),
    /// Sign this machine in through the browser
    Login(LoginOpts),
    /// Forget the stored credentials
    Logout(LogoutOpts),
    /// Show who the stored credentials belong to
    Status(AccountOpts),
    /// Trade the stored refresh token for a fresh ID token
    Refresh(AccountOpts),
}

#[derive(Args, Debug, Clone)]
pub struct ServeOpts {
    #[arg(long, env = "SUPERBOX_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,
    /// Externally visible base URL, used in verification and redirect URIs
    #[arg(long, env = "SUPERBOX_PUBLIC_URL")]
    pub public_url: Option<Url>,
    #[arg(long, env = "FIREBASE_API_KEY", hide_env_values = true)]
    pub firebase_api_key: Option<String>,
    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    pub google_client_id: Option<String>,
    #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true)]
    pub google_client_secret: Option<String>,
    #[arg(long, env = "GITHUB_CLIENT_ID")]
    pub github_client_id: Option<String>,
    #[arg(long, env = "GITHUB_CLIENT_SECRET", hide_env_values = true)]
    pub github_client_secret: Option<String>,
    /// Serve HTTPS when given together with --tls-key
    #[arg(long, env = "SUPERBOX_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    #[arg(long, env = "SUPERBOX_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
}

impl ServeOpts {
    pub fn oauth_settings(&self) -> Result<OAuthSettings, MyError> {
        Ok(OAuthSettings::new()?
            .with_credentials(
                Provider::Google,
                ProviderCredentials::from_parts(
                    self.google_client_id.clone(),
                    self.google_client_secret.clone(),
                ),
            )
            .with_credentials(
                Provider::Github,
                ProviderCredentials::from_parts(
                    self.github_client_id.clone(),
                    self.github_client_secret.clone(),
                ),
            ))
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoginOpts {
    #[arg(long, default_value = "google")]
    pub provider: Provider,
    #[arg(long, env = "SUPERBOX_API_URL", default_value = "http://localhost:8000")]
    pub api_url: Url,
    /// Defaults to ~/.superbox/auth.json
    #[arg(long, env = "SUPERBOX_AUTH_FILE")]
    pub auth_file: Option<PathBuf>,
    /// Only print the verification URL
    #[arg(long)]
    pub no_browser: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LogoutOpts {
    #[arg(long, env = "SUPERBOX_AUTH_FILE")]
    pub auth_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AccountOpts {
    #[arg(long, env = "FIREBASE_API_KEY", hide_env_values = true)]
    pub firebase_api_key: Option<String>,
    #[arg(long, env = "SUPERBOX_AUTH_FILE")]
    pub auth_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_login_defaults() {
        let opts = CliOpts::try_parse_from(["superbox", "login", "--provider", "GitHub"])
            .expect("parse");
        match opts.command {
            Command::Login(login) => {
                assert_eq!(login.provider, Provider::Github);
                assert!(!login.no_browser);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let opts = CliOpts::try_parse_from(["superbox", "login", "--no-browser"]).expect("parse");
        match opts.command {
            Command::Login(login) => {
                assert_eq!(login.provider, Provider::Google);
                assert!(login.no_browser);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_account_commands() {
        let opts = CliOpts::try_parse_from([
            "superbox",
            "status",
            "--firebase-api-key",
            "key",
            "--auth-file",
            "/tmp/auth.json",
        ])
        .expect("parse");
        match opts.command {
            Command::Status(status) => {
                assert_eq!(status.firebase_api_key.as_deref(), Some("key"));
                assert_eq!(status.auth_file, Some(PathBuf::from("/tmp/auth.json")));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(
            CliOpts::try_parse_from(["superbox", "refresh"]).expect("parse").command,
            Command::Refresh(_)
        ));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(CliOpts::try_parse_from(["superbox", "login", "--provider", "gitlab"]).is_err());
    }

    #[test]
    fn half_configured_provider_stays_off() {
        let opts = ServeOpts {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            public_url: None,
            firebase_api_key: None,
            google_client_id: Some("id".into()),
            google_client_secret: None,
            github_client_id: Some("id".into()),
            github_client_secret: Some("secret".into()),
            tls_cert: None,
            tls_key: None,
        };
        let settings = opts.oauth_settings().expect("settings");
        assert!(!settings.is_configured(Provider::Google));
        assert!(settings.is_configured(Provider::Github));
    }
}
