mod config;

use crate::config::Config;
use anyhow::Context;
use clap::Parser;
use footprint::fetch::{FetchPolicy, HttpTransport};
use footprint::geometry::WktService;
use footprint::headers::BrowserHeaders;
use footprint::identity::{ControllerSettings, IdentityController};
use footprint::metrics::WorkerMetrics;
use footprint::partition::Shard;
use footprint::store::CheckpointStore;
use footprint::tor::{TorBackend, TorSettings};
use footprint::worker::{ShardOutcome, Worker};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(
        slot = config.slot,
        shard = %config.shard_path.display(),
        table = %config.table.display(),
        "Worker starting"
    );

    let raw = tokio::fs::read(&config.shard_path)
        .await
        .with_context(|| format!("Failed to read shard file '{}'", config.shard_path.display()))?;
    let shard: Shard = serde_json::from_slice(&raw).context("Shard file is not valid JSON")?;
    if shard.slot != config.slot {
        anyhow::bail!("Shard file belongs to slot {}, not {}", shard.slot, config.slot);
    }
    tracing::info!(slot = shard.slot, links = shard.work_len(), shard_len = shard.len(), "Loaded shard");

    let metrics = Arc::new(WorkerMetrics::new(config.slot).context("Failed to register metrics")?);

    // --- 2. Start Metrics Server ---
    if let Some(addr) = config.metrics_listen_addr {
        let router = metrics.router();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(addr = %addr, error = %e, "Failed to bind metrics server");
                    return;
                }
            };
            tracing::info!(addr = %addr, "Worker metrics server started");
            if let Err(e) = axum::serve(listener, router.into_make_service()).await {
                tracing::error!(error = %e, "Metrics server exited with an error.");
            }
        });
    }

    // --- 3. Assemble the pipeline ---
    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let backend = TorBackend::new(TorSettings {
        socks_port_base: config.socks_port_base,
        control_port_base: config.control_port_base,
        control_password: config.control_password.clone(),
        probe_url: config.probe_url.clone(),
        request_timeout,
        ..TorSettings::default()
    });
    let mut worker = Worker {
        controller: IdentityController::new(
            config.slot,
            backend,
            ControllerSettings {
                rotation_ceiling: config.rotation_ceiling,
                ..ControllerSettings::default()
            },
        ),
        transport: HttpTransport {
            timeout: request_timeout,
        },
        headers: BrowserHeaders,
        lookup: WktService::new(&config.wkt_endpoint, request_timeout)?,
        store: CheckpointStore::attach(&config.table),
        policy: FetchPolicy::default(),
        metrics,
    };

    // --- 4. Run the shard ---
    let started = Instant::now();
    let outcome = tokio::select! {
        outcome = worker.run(&shard) => Some(outcome),
        _ = shutdown_signal() => {
            tracing::info!(slot = config.slot, "Shutdown signal received.");
            None
        }
    };
    exit_status(config.slot, outcome, started.elapsed().as_secs())
}

/// Maps how the shard ended onto the process result. Only a completed shard
/// exits 0; `None` means the run was interrupted.
fn exit_status(slot: u16, outcome: Option<ShardOutcome>, elapsed_s: u64) -> anyhow::Result<()> {
    match outcome {
        Some(ShardOutcome::Completed(stats)) => {
            tracing::info!(
                slot,
                links = stats.links_processed,
                records = stats.records_appended,
                dropped_batches = stats.batches_dropped,
                elapsed_s,
                "Worker done"
            );
            Ok(())
        }
        Some(ShardOutcome::Aborted {
            position,
            stats,
            error,
        }) => {
            tracing::error!(
                slot,
                position,
                links = stats.links_processed,
                records = stats.records_appended,
                elapsed_s,
                "Worker stopped early"
            );
            Err(anyhow::Error::new(error)
                .context(format!("Worker {slot} abandoned its shard at link {position}")))
        }
        None => anyhow::bail!("Worker {slot} was interrupted before finishing its shard"),
    }
}

/// Resolves on SIGINT or SIGTERM.
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

#[cfg(test)]
mod tests {
    use super::*;
    use footprint::worker::ShardStats;
    use footprint::CollectError;

    #[test]
    fn only_completed_shards_exit_cleanly() {
        assert!(exit_status(1, Some(ShardOutcome::Completed(ShardStats::default())), 3).is_ok());

        let aborted = ShardOutcome::Aborted {
            position: 4,
            stats: ShardStats::default(),
            error: CollectError::ConnectivityExhausted { slot: 1, rotations: 50 },
        };
        let err = exit_status(1, Some(aborted), 3).unwrap_err();
        assert!(err.to_string().contains("link 4"));

        let err = exit_status(1, None, 3).unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }
}
