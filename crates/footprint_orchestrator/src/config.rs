use clap::Parser;
use footprint::fetch::DEFAULT_REQUEST_TIMEOUT;
use footprint::geometry::DEFAULT_WKT_ENDPOINT;
use footprint::identity::DEFAULT_ROTATION_CEILING;
use footprint::link::{DEFAULT_OVERPASS_ENDPOINT, DEFAULT_RADIUS_M};
use footprint::seed::SearchMode;
use footprint::store::DEFAULT_TABLE;
use footprint::tor::{DEFAULT_CONTROL_PORT_BASE, DEFAULT_PROBE_URL, DEFAULT_SOCKS_PORT_BASE};
use std::path::PathBuf;
use std::time::Duration;

/// `footprint_orchestrator` - collects building footprints around seed points.
///
/// Filters out seeds already present in the buildings table, splits the rest
/// across worker slots and runs one `footprint_worker` process per slot, each
/// behind its own Tor instance.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Number of worker slots. Slot `i` uses SOCKS port `socks_port_base + i`
    /// and control port `control_port_base + i`.
    #[arg(default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// CSV of seed points with `lat` and `lon` columns.
    #[arg(long, env = "FOOTPRINT_SEED_FILE", default_value = "start.csv")]
    pub seed_file: PathBuf,

    /// The buildings table. Created if missing, appended to otherwise.
    #[arg(long, env = "FOOTPRINT_TABLE", default_value = DEFAULT_TABLE)]
    pub table: PathBuf,

    /// Search radius in metres, radius mode only.
    #[arg(long, default_value_t = DEFAULT_RADIUS_M)]
    pub radius: u32,

    #[arg(long, default_value_t = SearchMode::Boundary)]
    pub mode: SearchMode,

    /// Truncate the buildings table before starting, so no seed is skipped.
    #[arg(long)]
    pub force: bool,

    /// Path to the `footprint_worker` binary. Defaults to the one next to
    /// this executable.
    #[arg(long, env = "WORKER_BINARY_PATH")]
    pub worker_binary: Option<PathBuf>,

    /// Shard hand-off files are written to `<run_dir>/<run id>/`.
    #[arg(long, env = "FOOTPRINT_RUN_DIR", default_value = "runs")]
    pub run_dir: PathBuf,

    #[arg(long, env = "TOR_SOCKS_PORT_BASE", default_value_t = DEFAULT_SOCKS_PORT_BASE)]
    pub socks_port_base: u16,

    #[arg(long, env = "TOR_CONTROL_PORT_BASE", default_value_t = DEFAULT_CONTROL_PORT_BASE)]
    pub control_port_base: u16,

    #[arg(long, env = "TOR_CONTROL_PASSWORD", default_value = "", hide_env_values = true)]
    pub control_password: String,

    /// Failed rotations after which a slot gives up on connectivity.
    #[arg(long, default_value_t = DEFAULT_ROTATION_CEILING)]
    pub rotation_ceiling: u32,

    /// Hand shards to every slot without checking connectivity first.
    #[arg(long)]
    pub skip_preflight: bool,

    /// When set, worker `i` serves Prometheus metrics on port `start + i`.
    #[arg(long, env = "WORKER_METRICS_PORT_START")]
    pub worker_metrics_port_start: Option<u16>,

    #[arg(long, env = "OVERPASS_ENDPOINT", default_value = DEFAULT_OVERPASS_ENDPOINT)]
    pub overpass_endpoint: String,

    #[arg(long, env = "WKT_ENDPOINT", default_value = DEFAULT_WKT_ENDPOINT)]
    pub wkt_endpoint: String,

    #[arg(long, env = "PROBE_URL", default_value = DEFAULT_PROBE_URL)]
    pub probe_url: String,

    /// Per-request timeout for Overpass queries, in seconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn worker_binary(&self) -> anyhow::Result<PathBuf> {
        match &self.worker_binary {
            Some(path) => Ok(path.clone()),
            None => {
                let exe = std::env::current_exe()?;
                Ok(exe.with_file_name(format!("footprint_worker{}", std::env::consts::EXE_SUFFIX)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_collector_conventions() {
        let config = Config::try_parse_from(["footprint_orchestrator"]).unwrap();
        assert_eq!(config.workers, 10);
        assert_eq!(config.mode, SearchMode::Boundary);
        assert_eq!(config.radius, 200);
        assert_eq!(config.table, PathBuf::from("buildings.csv"));
        assert_eq!(config.socks_port_base, 9080);
        assert_eq!(config.control_port_base, 8148);
        assert_eq!(config.rotation_ceiling, 50);
        assert!(!config.force);
        assert_eq!(config.worker_metrics_port_start, None);
    }

    #[test]
    fn positional_worker_count_and_mode() {
        let config =
            Config::try_parse_from(["footprint_orchestrator", "4", "--mode", "radius", "--force"]).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.mode, SearchMode::Radius);
        assert!(config.force);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Config::try_parse_from(["footprint_orchestrator", "0"]).is_err());
    }
}
