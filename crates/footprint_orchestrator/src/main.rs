mod config;
mod preflight;
mod resume;
mod worker_manager;

use crate::config::Config;
use crate::worker_manager::{write_shards, WorkerManager, WorkerManagerConfig};
use anyhow::Context;
use clap::Parser;
use footprint::identity::ControllerSettings;
use footprint::partition::partition_for_slots;
use footprint::tor::{TorBackend, TorSettings};
use std::time::Instant;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(
        workers = config.workers,
        mode = %config.mode,
        seed_file = %config.seed_file.display(),
        table = %config.table.display(),
        force = config.force,
        "Loaded configuration"
    );
    let started = Instant::now();

    // --- 1. Resume filtering ---
    let links = resume::prepare(&config)?;
    if links.is_empty() {
        tracing::info!("Every seed point is already collected. Nothing to do.");
        return Ok(());
    }

    // --- 2. Identity preflight ---
    let tor = TorSettings {
        socks_port_base: config.socks_port_base,
        control_port_base: config.control_port_base,
        control_password: config.control_password.clone(),
        probe_url: config.probe_url.clone(),
        request_timeout: config.request_timeout(),
        ..TorSettings::default()
    };
    let slots: Vec<u16> = if config.skip_preflight {
        (0..config.workers).collect()
    } else {
        let preflight_started = Instant::now();
        let settings = ControllerSettings {
            rotation_ceiling: config.rotation_ceiling,
            ..ControllerSettings::default()
        };
        let healthy = preflight::healthy_slots(&TorBackend::new(tor), config.workers, settings).await;
        tracing::info!(
            healthy = healthy.len(),
            workers = config.workers,
            elapsed_ms = preflight_started.elapsed().as_millis() as u64,
            "Identity preflight finished"
        );
        healthy
    };
    if slots.is_empty() {
        anyhow::bail!("No worker slot could reach the network; check the Tor instances");
    }

    // --- 3. Partition and hand off ---
    let shards = partition_for_slots(links, &slots)?;
    let shard_len = shards.first().map_or(0, |shard| shard.len());
    tracing::info!(workers = shards.len(), shard_len, "Job shape per worker");

    let run_id = uuid::Uuid::new_v4().to_string();
    let launches = write_shards(&config.run_dir.join(&run_id), &shards)?;
    tracing::info!(run_id, "Shard files written");

    let manager = WorkerManager::new(WorkerManagerConfig {
        worker_binary: config.worker_binary()?,
        table: config.table.clone(),
        socks_port_base: config.socks_port_base,
        control_port_base: config.control_port_base,
        control_password: config.control_password.clone(),
        rotation_ceiling: config.rotation_ceiling,
        request_timeout: config.request_timeout(),
        wkt_endpoint: config.wkt_endpoint.clone(),
        probe_url: config.probe_url.clone(),
        metrics_port_start: config.worker_metrics_port_start,
    });

    // --- 4. Supervise ---
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut manager_handle = manager.spawn(launches, shutdown_rx);

    let exits = tokio::select! {
        res = &mut manager_handle => res,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received. Terminating workers...");
            // Dropping the sender wakes every supervisor.
            drop(shutdown_tx);
            manager_handle.await
        }
    }
    .context("Worker manager task failed")?;

    let succeeded = exits.iter().filter(|exit| exit.succeeded()).count();
    tracing::info!(
        succeeded,
        launched = exits.len(),
        elapsed_s = started.elapsed().as_secs(),
        "Successful workers: {succeeded} out of {}",
        exits.len()
    );
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
