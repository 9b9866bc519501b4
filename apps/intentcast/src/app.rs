//! Application orchestrator: wires the registry, service and server together.

use std::sync::Arc;
use std::time::Duration;

use intentcast_server::{
    BroadcastServer, ConnectionRegistry, IntentionService, SchedulerConfig, ServerConfig,
    ServiceConfig,
};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Builds the service configuration from the loaded config.
pub fn service_config(config: &Config) -> ServiceConfig {
    ServiceConfig {
        default_frequency: config.default_frequency,
        default_field_type: config.default_field_type,
        scheduler: SchedulerConfig {
            grace_window: config.grace_window(),
        },
    }
}

/// Runs the broadcaster until `cancel` fires or SIGINT arrives.
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let registry = Arc::new(ConnectionRegistry::new());
    let service = Arc::new(IntentionService::new(
        Arc::clone(&registry),
        service_config(&config),
    ));

    let server_config = ServerConfig {
        bind: config.bind,
        port: config.port,
    };
    let server = BroadcastServer::new(server_config, Arc::clone(&service), registry);
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tracing::info!(
        bind = %config.bind,
        port = config.port,
        default_frequency = config.default_frequency,
        default_field_type = %config.default_field_type,
        "broadcaster ready"
    );

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
        joined = &mut server_task => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("server stopped")),
                Err(e) => Err(anyhow::Error::new(e).context("server task panicked")),
            }
        }
    };

    tracing::info!("stopping services...");
    service.shutdown().await;
    server.shutdown();
    if !server_task.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(2), server_task).await;
    }

    result
}
