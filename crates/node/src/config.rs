//! Command line and config file handling.
//!
//! Settings are layered: built-in defaults, then the JSON file named by `--config`, then
//! flags (each flag also reads a `SCHILLING_*` environment variable).

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use schilling_consensus::params::ParseNetworkError;
use schilling_consensus::Network;
use schilling_net::PeerGroupConfig;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;
pub const PEERS_FILE_NAME: &str = "peers.json";
pub const CHECKPOINTS_FILE_NAME: &str = "checkpoints.hashes";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Bounded in-memory history; nothing survives a restart.
    Memory,
    Fjall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "schilling-spv", version, about = "Schillingcoin SPV chain sync node")]
pub struct Args {
    /// JSON config file; flags override its values.
    #[arg(long, env = "SCHILLING_CONFIG")]
    pub config: Option<PathBuf>,
    /// main or regtest.
    #[arg(long, env = "SCHILLING_NETWORK")]
    pub network: Option<Network>,
    #[arg(long, value_enum, env = "SCHILLING_BACKEND")]
    pub backend: Option<Backend>,
    /// Holds the block store, checkpoints.hashes and peers.json.
    #[arg(long, env = "SCHILLING_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, value_enum, env = "SCHILLING_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
    /// Trusted node to connect to; repeat or separate with commas.
    #[arg(long = "connect", env = "SCHILLING_CONNECT", value_delimiter = ',')]
    pub connect: Vec<SocketAddr>,
    #[arg(long, env = "SCHILLING_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,
    /// Unix time before which blocks are downloaded as headers only.
    #[arg(long, env = "SCHILLING_FAST_CATCHUP_TIME")]
    pub fast_catchup_time: Option<u64>,
    /// Skip DNS seed lookups and rely on --connect and known peers.
    #[arg(long, env = "SCHILLING_NO_DNS_SEEDS")]
    pub no_dns_seeds: bool,
    #[arg(long, env = "SCHILLING_STATUS_INTERVAL_SECS")]
    pub status_interval_secs: Option<u64>,
    /// Block cache for the fjall backend, in MiB.
    #[arg(long, env = "SCHILLING_DB_CACHE_MB")]
    pub db_cache_mb: Option<u64>,
}

/// The `--config` file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub network: Option<String>,
    pub backend: Option<Backend>,
    pub data_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub connect: Vec<SocketAddr>,
    pub status_interval_secs: Option<u64>,
    pub db_cache_mb: Option<u64>,
    pub peer_group: Option<PeerGroupConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Network(#[from] ParseNetworkError),
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug)]
pub struct NodeConfig {
    pub network: Network,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    pub connect: Vec<SocketAddr>,
    pub status_interval: Duration,
    pub db_cache_bytes: Option<u64>,
    pub peer_group: PeerGroupConfig,
}

impl NodeConfig {
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::layer(args, file)
    }

    pub fn layer(args: Args, file: FileConfig) -> Result<Self, ConfigError> {
        let network = match (args.network, file.network.as_deref()) {
            (Some(network), _) => network,
            (None, Some(name)) => name.parse()?,
            (None, None) => Network::Mainnet,
        };
        let data_dir = args
            .data_dir
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(network));

        let mut peer_group = file.peer_group.unwrap_or_default();
        if let Some(max) = args.max_connections {
            peer_group.max_connections = max;
        }
        if let Some(time) = args.fast_catchup_time {
            peer_group.fast_catchup_time = time;
        }
        if args.no_dns_seeds {
            peer_group.use_dns_seeds = false;
        }
        if peer_group.peers_file.is_none() {
            peer_group.peers_file = Some(data_dir.join(PEERS_FILE_NAME));
        }

        let connect = if args.connect.is_empty() {
            file.connect
        } else {
            args.connect
        };
        let status_interval_secs = args
            .status_interval_secs
            .or(file.status_interval_secs)
            .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS)
            .max(1);

        Ok(Self {
            network,
            backend: args.backend.or(file.backend).unwrap_or(Backend::Fjall),
            data_dir,
            log_format: args.log_format.or(file.log_format).unwrap_or(LogFormat::Pretty),
            connect,
            status_interval: Duration::from_secs(status_interval_secs),
            db_cache_bytes: args
                .db_cache_mb
                .or(file.db_cache_mb)
                .map(|mb| mb.saturating_mul(1024 * 1024)),
            peer_group,
        })
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINTS_FILE_NAME)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

fn default_data_dir(network: Network) -> PathBuf {
    match network {
        Network::Mainnet => PathBuf::from(DEFAULT_DATA_DIR),
        other => Path::new(DEFAULT_DATA_DIR).join(other.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["schilling-spv"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("args")
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let config = NodeConfig::layer(args(&[]), FileConfig::default()).expect("config");
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.peer_group.max_connections, 8);
        assert_eq!(
            config.peer_group.peers_file,
            Some(PathBuf::from("data").join(PEERS_FILE_NAME))
        );
        assert_eq!(config.checkpoints_path(), PathBuf::from("data/checkpoints.hashes"));
        assert_eq!(config.db_cache_bytes, None);
    }

    #[test]
    fn flags_override_the_file() {
        let file: FileConfig = serde_json::from_str(
            r#"{
                "network": "regtest",
                "backend": "memory",
                "connect": ["10.0.0.1:19976"],
                "db_cache_mb": 64,
                "peer_group": { "max_connections": 3, "job_size": 16 }
            }"#,
        )
        .expect("file");
        let config = NodeConfig::layer(
            args(&[
                "--max-connections",
                "5",
                "--connect",
                "10.0.0.2:19976,10.0.0.3:19976",
                "--no-dns-seeds",
            ]),
            file,
        )
        .expect("config");

        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.data_dir, PathBuf::from("data/regtest"));
        assert_eq!(config.peer_group.max_connections, 5);
        assert_eq!(config.peer_group.job_size, 16);
        assert!(!config.peer_group.use_dns_seeds);
        assert_eq!(config.db_cache_bytes, Some(64 * 1024 * 1024));
        assert_eq!(
            config.connect,
            vec![
                "10.0.0.2:19976".parse::<SocketAddr>().expect("addr"),
                "10.0.0.3:19976".parse().expect("addr"),
            ]
        );
    }

    #[test]
    fn bad_network_name_in_file_is_reported() {
        let file = FileConfig {
            network: Some("testnet3".to_string()),
            ..FileConfig::default()
        };
        let err = NodeConfig::layer(args(&[]), file).unwrap_err();
        assert!(matches!(err, ConfigError::Network(_)));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        fs::write(&path, br#"{"netwrk": "main"}"#).expect("write");
        assert!(matches!(
            FileConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
