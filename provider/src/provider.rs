//! Provider lifecycle: start up, serve the gateway, shut down.

use std::sync::Arc;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, InferenceBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::{
    connect, run_heartbeat, run_read_loop, ConnectOptions, Dispatcher, GatewayConnection,
    GatewayReader, GatewaySender,
};
use crate::session::{generate_provider_id, Session};

/// A provider registered with the gateway and ready to serve.
pub struct Provider {
    config: Arc<Config>,
    backend: Arc<dyn InferenceBackend>,
    session: Arc<Session>,
    connection: Arc<GatewayConnection>,
    reader: GatewayReader,
}

impl Provider {
    /// Build the backend, check it, and register with the gateway.
    ///
    /// Nothing is left running if any step fails.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate_provider()?;

        let backend = Backend::from_config(&config.backend, &config.provider.model)?;
        check_backend(&backend, &config).await?;

        let session = Arc::new(Session::from_config(generate_provider_id(), &config));
        let options = ConnectOptions {
            hub_url: config.gateway.hub_url.clone(),
            registration: session
                .registration(&config.provider.description, &config.provider.token),
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.write_timeout(),
        };
        let (connection, reader) = connect(options).await?;

        tracing::info!(
            provider_id = %session.provider_id(),
            "Publishing {} via {} (max concurrent {})",
            session.model(),
            backend.kind(),
            session.max_concurrent()
        );

        Ok(Self {
            config: Arc::new(config),
            backend: Arc::new(backend),
            session,
            connection: Arc::new(connection),
            reader,
        })
    }

    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Serve requests until `cancel` fires or the gateway goes away.
    ///
    /// `cancel` is triggered on the way out in both cases, so anything else
    /// watching it stops too. Returns an error only on transport loss.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Provider {
            config,
            backend,
            session,
            connection,
            mut reader,
        } = self;

        let sender: Arc<dyn GatewaySender> = connection.clone();
        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&sender),
            Arc::clone(&session),
            config.heartbeat_interval(),
            cancel.clone(),
        ));

        let dispatcher = Dispatcher::new(backend, sender, session, config.provider.admission);
        let result = run_read_loop(&mut reader, &cancel, |envelope| {
            dispatcher.dispatch(envelope);
        })
        .await;

        cancel.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!("Heartbeat task failed: {}", e);
        }
        connection.close().await;

        match &result {
            Ok(()) => tracing::info!("Provider stopped"),
            Err(e) => tracing::error!("Gateway connection lost: {}", e),
        }
        result
    }
}

/// Startup health check, bounded by the configured timeout.
async fn check_backend(backend: &Backend, config: &Config) -> Result<()> {
    tracing::info!("Checking {} backend", backend.kind());
    match timeout(config.health_timeout(), backend.health()).await {
        Ok(result) => result,
        Err(_) => Err(Error::BackendUnavailable {
            backend: backend.kind().as_str(),
            message: format!(
                "health check timed out after {}s",
                config.gateway.health_timeout_secs
            ),
        }),
    }
}
