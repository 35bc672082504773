use anyhow::Context;
use footprint::partition::Shard;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::{process::Command, sync::watch, task::JoinHandle, time::sleep};

const DEFAULT_WORKER_LOG: &str = "info,hyper=warn,reqwest=warn";
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Settings every worker process receives through its environment.
#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    pub worker_binary: PathBuf,
    pub table: PathBuf,
    pub socks_port_base: u16,
    pub control_port_base: u16,
    pub control_password: String,
    pub rotation_ceiling: u32,
    pub request_timeout: Duration,
    pub wkt_endpoint: String,
    pub probe_url: String,
    pub metrics_port_start: Option<u16>,
}

/// A shard written to disk, ready to be handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub slot: u16,
    pub shard_path: PathBuf,
    pub links: usize,
}

#[derive(Debug)]
pub struct WorkerExit {
    pub slot: u16,
    pub status: anyhow::Result<ExitStatus>,
}

impl WorkerExit {
    pub fn succeeded(&self) -> bool {
        matches!(&self.status, Ok(status) if status.success())
    }
}

/// Serializes each shard to `<dir>/shard-<slot>.json`.
pub fn write_shards(dir: &Path, shards: &[Shard]) -> anyhow::Result<Vec<WorkerLaunch>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create run directory '{}'", dir.display()))?;
    shards
        .iter()
        .map(|shard| -> anyhow::Result<WorkerLaunch> {
            let shard_path = dir.join(format!("shard-{}.json", shard.slot));
            let json = serde_json::to_vec(shard)?;
            std::fs::write(&shard_path, json)
                .with_context(|| format!("Failed to write shard file '{}'", shard_path.display()))?;
            Ok(WorkerLaunch {
                slot: shard.slot,
                shard_path,
                links: shard.work_len(),
            })
        })
        .collect()
}

/// Runs one `footprint_worker` process per launch and waits for all of them.
pub struct WorkerManager {
    config: WorkerManagerConfig,
}

impl WorkerManager {
    pub fn new(config: WorkerManagerConfig) -> Self {
        Self { config }
    }

    /// Spawns every worker and supervises it until it exits. A change on
    /// (or drop of) `shutdown_rx` terminates all live workers.
    pub fn spawn(
        self,
        launches: Vec<WorkerLaunch>,
        shutdown_rx: watch::Receiver<()>,
    ) -> JoinHandle<Vec<WorkerExit>> {
        tokio::spawn(async move {
            let mut supervisors = Vec::with_capacity(launches.len());
            let mut exits = Vec::new();
            for launch in &launches {
                match self.spawn_worker(launch) {
                    Ok(child) => {
                        let rx = shutdown_rx.clone();
                        supervisors.push(tokio::spawn(supervise(launch.slot, child, rx)));
                    }
                    Err(e) => {
                        tracing::error!(slot = launch.slot, error = %e, "Failed to spawn worker");
                        exits.push(WorkerExit {
                            slot: launch.slot,
                            status: Err(e),
                        });
                    }
                }
            }
            tracing::info!(workers = supervisors.len(), "All workers spawned");

            for joined in join_all(supervisors).await {
                match joined {
                    Ok(exit) => exits.push(exit),
                    Err(e) => tracing::error!(error = %e, "Worker supervisor panicked"),
                }
            }
            exits.sort_by_key(|exit| exit.slot);
            exits
        })
    }

    fn spawn_worker(&self, launch: &WorkerLaunch) -> anyhow::Result<tokio::process::Child> {
        let config = &self.config;
        tracing::info!(slot = launch.slot, links = launch.links, "Spawning worker process");

        let mut command = Command::new(&config.worker_binary);
        command
            .env("WORKER_SLOT", launch.slot.to_string())
            .env("WORKER_SHARD_PATH", &launch.shard_path)
            .env("FOOTPRINT_TABLE", &config.table)
            .env("TOR_SOCKS_PORT_BASE", config.socks_port_base.to_string())
            .env("TOR_CONTROL_PORT_BASE", config.control_port_base.to_string())
            .env("TOR_CONTROL_PASSWORD", &config.control_password)
            .env("ROTATION_CEILING", config.rotation_ceiling.to_string())
            .env("REQUEST_TIMEOUT_SECS", config.request_timeout.as_secs().to_string())
            .env("WKT_ENDPOINT", &config.wkt_endpoint)
            .env("PROBE_URL", &config.probe_url)
            .env(
                "RUST_LOG",
                std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_WORKER_LOG.into()),
            )
            .kill_on_drop(true);
        if let Some(start) = config.metrics_port_start {
            let port = start
                .checked_add(launch.slot)
                .context("Worker metrics port overflows u16")?;
            command.env("WORKER_METRICS_ADDR", format!("0.0.0.0:{port}"));
        }

        command.spawn().with_context(|| {
            format!(
                "Failed to spawn worker binary at '{}'",
                config.worker_binary.display()
            )
        })
    }
}

async fn supervise(
    slot: u16,
    mut child: tokio::process::Child,
    mut shutdown_rx: watch::Receiver<()>,
) -> WorkerExit {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown_rx.changed() => {
            terminate(slot, &mut child).await;
            child.wait().await
        }
    };

    match &status {
        Ok(status) if status.success() => tracing::info!(slot, "Worker finished"),
        Ok(status) => tracing::warn!(slot, exit_status = %status, "Worker exited with failure"),
        Err(e) => tracing::error!(slot, error = %e, "Error waiting for worker process"),
    }
    WorkerExit {
        slot,
        status: status.map_err(anyhow::Error::from),
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate(slot: u16, child: &mut tokio::process::Child) {
    let Some(pid) = child.id() else {
        return;
    };
    tracing::debug!(slot, pid, "Sending SIGTERM to worker process.");
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    );

    tokio::select! {
        _ = sleep(TERMINATE_GRACE) => {
            tracing::warn!(slot, pid, "Worker did not terminate gracefully. Sending SIGKILL.");
            if let Err(e) = child.start_kill() {
                tracing::error!(slot, pid, error = %e, "Failed to SIGKILL worker process.");
            }
        }
        _ = child.wait() => {
            tracing::debug!(slot, pid, "Worker terminated gracefully.");
        }
    }
}
