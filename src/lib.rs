pub mod cli;
pub mod client;
pub mod constants;
pub mod device;
pub mod error;
pub mod logging;
pub mod oauth;
pub(crate) mod web;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use url::Url;

pub use crate::cli::CliOpts;
use crate::cli::ServeOpts;
use crate::device::{DeviceFlow, DeviceSessionStore, SystemClock};
use crate::error::MyError;
use crate::oauth::{FirebaseExchange, HttpProviderClient};
pub(crate) use crate::web::build_app;

#[derive(Clone)]
pub struct AppState {
    pub device_flow: Arc<DeviceFlow>,
    /// Overrides the base URL otherwise derived from request headers
    pub public_url: Option<Url>,
}

impl AppState {
    /// Wire up the store and the real upstream clients
    pub fn new(opts: &ServeOpts) -> Result<Self, MyError> {
        let settings = Arc::new(opts.oauth_settings()?);
        let provider_client = Arc::new(HttpProviderClient::new(settings.clone())?);
        let exchange = Arc::new(FirebaseExchange::new(opts.firebase_api_key.clone())?);

        let device_flow = DeviceFlow::new(
            Arc::new(DeviceSessionStore::new()),
            Arc::new(SystemClock),
            settings,
            provider_client,
            exchange,
        );
        Ok(Self {
            device_flow: Arc::new(device_flow),
            public_url: opts.public_url.clone(),
        })
    }
}

pub async fn start_server(opts: ServeOpts) -> Result<(), MyError> {
    use axum_server::tls_rustls::RustlsConfig;

    let shared_state = AppState::new(&opts)?;
    if !shared_state.device_flow.exchange().is_configured() {
        error!("FIREBASE_API_KEY is not set, logins will fail at the token exchange");
    }

    let app = build_app(shared_state);
    let addr: SocketAddr = opts
        .listen
        .parse()
        .map_err(|err| MyError::Config(format!("invalid listen address {}: {err}", opts.listen)))?;

    match (&opts.tls_cert, &opts.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = RustlsConfig::from_pem_file(cert, key).await.map_err(|err| {
                error!(
                    cert = %cert.display(),
                    key = %key.display(),
                    "Failed to load TLS certificates: {err:?}"
                );
                MyError::from(err)
            })?;
            info!("Starting HTTPS server on https://{addr}");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        (None, None) => {
            info!("Starting HTTP server on http://{addr}");
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            return Err(MyError::Config(
                "TLS needs both a certificate and a key".to_string(),
            ))
        }
    }
    Ok(())
}
