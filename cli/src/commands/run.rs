// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `fwsync-agent run`
//!
//! Builds the adapters from configuration, performs a full resync so the
//! firewall matches current policy, then serves the event intake API until
//! Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use fwsync_core::application::synchronizer::{FirewallSyncService, StandardFirewallSyncService};
use fwsync_core::domain::agent_config::AgentConfigManifest;
use fwsync_core::domain::backend::FirewallBackend;
use fwsync_core::infrastructure::{
    CommandBackend, EventBus, HttpPolicyClient, HttpResolverClient, RecordingBackend, VmadmInventory,
};
use fwsync_core::presentation::api;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Compute changesets without invoking the firewall backend command
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the startup resync
    #[arg(long)]
    pub no_resync: bool,

    /// Override the configured API port
    #[arg(long)]
    pub port: Option<u16>,
}

pub async fn execute(args: RunArgs, config: AgentConfigManifest) -> Result<()> {
    config.validate().context("Configuration validation failed")?;
    info!(name = %config.metadata.name, "Configuration loaded");

    if config.spec.observability.metrics.enabled {
        install_metrics(config.spec.observability.metrics.port)?;
    }

    let (service, event_bus) = build_service(&config, args.dry_run);

    if !args.no_resync {
        // A failed resync leaves the agent serving; the next resync or
        // event repairs the state.
        match service.resync().await {
            Ok(outcome) => info!(
                active_rules = service.state().state.active_rules.len(),
                directory_requests = outcome.directory_requests,
                "Startup resync complete"
            ),
            Err(e) => error!(error = %e, "Startup resync failed"),
        }
    }

    let port = args.port.unwrap_or(config.spec.api.port);
    let addr = format!("{}:{}", config.spec.api.bind_address, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("fwsync agent listening on {}", addr);

    axum::serve(listener, api::app(service, event_bus))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("fwsync agent shutting down");
    Ok(())
}

/// Wire the production adapters into a synchronizer.
pub fn build_service(
    config: &AgentConfigManifest,
    dry_run: bool,
) -> (Arc<StandardFirewallSyncService>, Arc<EventBus>) {
    let spec = &config.spec;
    let backend: Arc<dyn FirewallBackend> = if dry_run {
        warn!("Dry run: firewall changesets are computed but not applied");
        Arc::new(RecordingBackend::new())
    } else {
        Arc::new(CommandBackend::from_config(&spec.backend))
    };

    let event_bus = Arc::new(EventBus::with_default_capacity());
    let service = Arc::new(StandardFirewallSyncService::new(
        Arc::new(VmadmInventory::from_config(&spec.inventory, spec.server.uuid)),
        Arc::new(HttpPolicyClient::from_config(&spec.policy)),
        Arc::new(HttpResolverClient::from_config(&spec.directory)),
        backend,
        event_bus.clone(),
    ));
    (service, event_bus)
}

fn install_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exported on port {}", port);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_service_starts_empty() {
        let config = AgentConfigManifest::default();
        let (service, event_bus) = build_service(&config, true);
        let state = service.state();
        assert!(state.state.active_rules.is_empty());
        assert_eq!(state.tag_cache_entries, 0);
        assert_eq!(event_bus.subscriber_count(), 0);
    }
}
