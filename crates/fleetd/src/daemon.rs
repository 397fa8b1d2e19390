//! Wiring: registry, provisioner, auto-scaler, background loops and the
//! API server, with graceful shutdown on Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use fleet_api::{ApiState, build_router};
use fleet_autoscale::Autoscaler;
use fleet_core::FleetConfig;
use fleet_core::memory::{MemoryCatalog, MemoryIaas, MemoryRouter, MemoryRuntime};
use fleet_pipeline::Provisioner;
use fleet_registry::{AutoScaleRule, Cluster, StateStore};

pub struct Daemon {
    config: FleetConfig,
    autoscaler: Autoscaler,
}

impl Daemon {
    /// Build every subsystem on the in-memory collaborators. The registry
    /// itself is persisted under `daemon.data_dir`.
    pub fn with_memory_provider(config: FleetConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.daemon.data_dir)?;
        let db_path = config.daemon.data_dir.join("fleet.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let runtime = Arc::new(MemoryRuntime::new());
        let cluster = Cluster::new(store, runtime)
            .with_legacy_rule(AutoScaleRule::from_legacy(&config.autoscale));
        let provisioner = Provisioner::new(
            cluster,
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryRouter::new()),
            config.scheduler.clone(),
            config.pipeline.clone(),
        );
        info!(
            max_workers = config.pipeline.max_workers,
            node_action_limit = config.pipeline.node_action_limit,
            runtime_timeout_ms = config.pipeline.runtime_timeout().as_millis() as u64,
            router_timeout_ms = config.pipeline.router_timeout().as_millis() as u64,
            "provisioner initialized"
        );

        let autoscaler = Autoscaler::new(
            provisioner,
            Arc::new(MemoryIaas::new()),
            config.autoscale.clone(),
        );
        Ok(Self { config, autoscaler })
    }

    /// Serve the API and run the background loops until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let provisioner = self.autoscaler.provisioner().clone();

        // ── Background tasks ───────────────────────────────────────

        let rebuild_shutdown = shutdown_rx.clone();
        let rebuild_handle = tokio::spawn(async move {
            provisioner.run_route_rebuilds(rebuild_shutdown).await;
        });

        let autoscale_handle = if self.config.autoscale.enabled {
            let autoscaler = self.autoscaler.clone();
            let autoscale_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                autoscaler.run(autoscale_shutdown).await;
            }))
        } else {
            info!("autoscale disabled, node-autoscale-run still available on demand");
            None
        };

        // ── API server ─────────────────────────────────────────────

        let router = build_router(ApiState::new(self.autoscaler.clone()));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.daemon.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "API server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "unable to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        if rebuild_handle.await.is_err() {
            warn!("route rebuild worker panicked");
        }
        if let Some(handle) = autoscale_handle
            && handle.await.is_err()
        {
            warn!("autoscaler panicked");
        }

        info!("fleet daemon stopped");
        Ok(())
    }
}
