use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use fanout_network::SocketSpec;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Parse(#[from] clap::Error),
    #[error("a listener spec and at least one destination are required")]
    Incomplete,
}

/// The command line. When `--config` is given the file wins wholesale: it
/// holds the same argument list, one token per line, and is re-read on
/// SIGHUP.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fanout",
    version,
    about = "Best-effort packet relay: one inbound socket fanned out to N destinations with per-destination disk spill"
)]
struct Cli {
    /// Inbound listener endpoint, host:port[/proto]
    listener: Option<SocketSpec>,
    /// Downstream destination endpoints
    destinations: Vec<SocketSpec>,
    /// Microseconds a stalled destination may lag before its backlog
    /// spills to disk
    #[arg(long, default_value_t = 1_000_000)]
    spill_usec: u64,
    /// Listener poll and worker dequeue timeout, milliseconds
    #[arg(long, default_value_t = 1)]
    polling_interval_ms: u64,
    /// Reconnect backoff ceiling, milliseconds
    #[arg(long, default_value_t = 1000)]
    sleep_after_disaster_ms: u64,
    /// Outbound TCP connect/send ceiling, seconds
    #[arg(long, default_value_t = 2)]
    tcp_send_timeout: u64,
    /// Requested kernel receive buffer on the inbound socket, bytes
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    server_socket_rcvbuf: usize,
    /// Received-packet budget per second; 0 disables the limit
    #[arg(long, default_value_t = 0)]
    max_pps: u32,
    /// Directory receiving per-destination spill files
    #[arg(long, default_value = "/tmp")]
    fallback_root: PathBuf,
    /// Soft cap on each in-memory destination queue, items
    #[arg(long, default_value_t = 65_536)]
    queue_cap: usize,
    /// Graphite plaintext sink for counters, host:port[/proto]
    #[arg(long)]
    graphite: Option<SocketSpec>,
    /// Name prefix for emitted counters
    #[arg(long, default_value = "fanout")]
    graphite_prefix: String,
    /// Seconds between counter snapshots
    #[arg(long, default_value_t = 10)]
    stats_interval_secs: u64,
    /// Argument-list file replacing the command line; re-read on SIGHUP
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Immutable configuration snapshot handed to the pipeline.
///
/// The pipeline never parses anything itself; reload builds a fresh
/// snapshot from the config file and swaps components over to it.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: SocketSpec,
    pub destinations: Vec<SocketSpec>,
    /// Stall threshold: how long a blob may wait on a broken destination
    /// before it is diverted to disk.
    pub spill: Duration,
    pub polling_interval: Duration,
    pub sleep_after_disaster: Duration,
    pub tcp_send_timeout: Duration,
    pub server_socket_rcvbuf: usize,
    pub max_pps: u32,
    pub fallback_root: PathBuf,
    pub queue_cap: usize,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsConfig {
    pub graphite: Option<SocketSpec>,
    pub prefix: String,
    pub interval: Duration,
}

impl Cli {
    fn into_config(self) -> Result<Config, ConfigError> {
        let Some(listener) = self.listener else {
            return Err(ConfigError::Incomplete);
        };
        if self.destinations.is_empty() {
            return Err(ConfigError::Incomplete);
        }
        Ok(Config {
            listener,
            destinations: self.destinations,
            spill: Duration::from_micros(self.spill_usec),
            polling_interval: Duration::from_millis(self.polling_interval_ms.max(1)),
            sleep_after_disaster: Duration::from_millis(self.sleep_after_disaster_ms.max(1)),
            tcp_send_timeout: Duration::from_secs(self.tcp_send_timeout.max(1)),
            server_socket_rcvbuf: self.server_socket_rcvbuf,
            max_pps: self.max_pps,
            fallback_root: self.fallback_root,
            queue_cap: self.queue_cap.max(1),
            stats: StatsConfig {
                graphite: self.graphite,
                prefix: self.graphite_prefix,
                interval: Duration::from_secs(self.stats_interval_secs.max(1)),
            },
        })
    }
}

impl Config {
    /// Parses the process command line; `--help`/`--version`/usage errors
    /// exit here, like any clap binary. Returns the snapshot plus the
    /// config file path to watch on reload, if one was given.
    pub fn from_cli() -> Result<(Config, Option<PathBuf>), ConfigError> {
        let cli = Cli::parse();
        match cli.config {
            Some(path) => {
                let config = Config::from_file(&path)?;
                Ok((config, Some(path)))
            }
            None => Ok((cli.into_config()?, None)),
        }
    }

    /// Builds a snapshot from an argument-list file: same tokens as the
    /// command line, whitespace/newline separated, `#` starts a comment.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let tokens = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or(""))
            .flat_map(str::split_whitespace);
        let cli = Cli::try_parse_from(std::iter::once("fanout").chain(tokens))?;
        cli.into_config()
    }

    /// Arguments built elsewhere (tests, embedding); `argv[0]` is implied.
    pub fn from_args<I, T>(args: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let args = std::iter::once("fanout".to_string()).chain(args.into_iter().map(Into::into));
        Cli::try_parse_from(args)?.into_config()
    }
}
