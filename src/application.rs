use crate::config::Settings;
use crate::log_messages::application as messages;
use crate::proxy::Gateway;
use crate::{Error, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, instrument};

/// Main application struct: settings plus the gateway built from them
pub struct Application {
    settings: Settings,
    gateway: Gateway,
}

impl Application {
    #[instrument(skip(settings))]
    pub fn new(settings: Settings) -> Result<Self> {
        let gateway = Gateway::builder(settings.gateway_config())
            .routes(settings.routes.iter().cloned())
            .build()?;
        info!(routes = ?gateway.route_names(), "Gateway configured");
        Ok(Self { settings, gateway })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Bind the configured address and serve until ctrl-c
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let address = self.settings.bind_address();
        let addr: SocketAddr = address.parse().map_err(|e: std::net::AddrParseError| {
            Error::InvalidAddress {
                address: address.clone(),
                reason: e.to_string(),
            }
        })?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        info!(address = %listener.local_addr()?, "{}", messages::LISTENING);
        let router = self.gateway.into_router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("{}", messages::STOPPED);
        Ok(())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("{}", messages::SHUTTING_DOWN);
    }
}
