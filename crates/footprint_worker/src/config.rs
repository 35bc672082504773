use clap::Parser;
use footprint::fetch::DEFAULT_REQUEST_TIMEOUT;
use footprint::geometry::DEFAULT_WKT_ENDPOINT;
use footprint::identity::DEFAULT_ROTATION_CEILING;
use footprint::store::DEFAULT_TABLE;
use footprint::tor::{DEFAULT_CONTROL_PORT_BASE, DEFAULT_PROBE_URL, DEFAULT_SOCKS_PORT_BASE};
use std::net::SocketAddr;
use std::path::PathBuf;

/// `footprint_worker` - collects the buildings of one shard.
///
/// Normally launched by `footprint_orchestrator`, which sets every option
/// through the environment. The worker owns one Tor instance (the ports at
/// `base + slot`) for its whole lifetime and appends what it finds to the
/// shared buildings table.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "WORKER_SLOT")]
    pub slot: u16,

    /// JSON shard file written by the orchestrator.
    #[arg(long, env = "WORKER_SHARD_PATH")]
    pub shard_path: PathBuf,

    #[arg(long, env = "FOOTPRINT_TABLE", default_value = DEFAULT_TABLE)]
    pub table: PathBuf,

    #[arg(long, env = "TOR_SOCKS_PORT_BASE", default_value_t = DEFAULT_SOCKS_PORT_BASE)]
    pub socks_port_base: u16,

    #[arg(long, env = "TOR_CONTROL_PORT_BASE", default_value_t = DEFAULT_CONTROL_PORT_BASE)]
    pub control_port_base: u16,

    #[arg(long, env = "TOR_CONTROL_PASSWORD", default_value = "", hide_env_values = true)]
    pub control_password: String,

    #[arg(long, env = "ROTATION_CEILING", default_value_t = DEFAULT_ROTATION_CEILING)]
    pub rotation_ceiling: u32,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    pub request_timeout_secs: u64,

    #[arg(long, env = "WKT_ENDPOINT", default_value = DEFAULT_WKT_ENDPOINT)]
    pub wkt_endpoint: String,

    #[arg(long, env = "PROBE_URL", default_value = DEFAULT_PROBE_URL)]
    pub probe_url: String,

    /// The listen address for this worker's Prometheus metrics server.
    /// No server is started when unset.
    #[arg(long, env = "WORKER_METRICS_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,
}
