//! Configuration file support for the verifi service.
//!
//! Loads an optional `verifi.toml`. CLI flags override config file values.
//! If no config file exists, defaults are used.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::measurement::ArchiveSource;

/// Default config file name.
pub const CONFIG_FILE: &str = "verifi.toml";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct VerifiConfig {
    pub server: ServerConfig,
    pub sources: SourcesConfig,
    pub consensus: ConsensusConfig,
    pub verifier: VerifierConfig,
    pub workflow: WorkflowConfig,
}

/// HTTP server section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: constants::DEFAULT_RPC_PORT,
        }
    }
}

/// Archive sources and retrieval settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub archives: Vec<ArchiveSource>,
    /// Gateway URL prefixes; the content id is appended.
    pub gateways: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        SourcesConfig {
            archives: default_archives(),
            gateways: vec![],
            timeout_secs: constants::SOURCE_TIMEOUT_SECS,
        }
    }
}

/// Redundant execution settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub redundancy: usize,
    pub context_timeout_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            redundancy: constants::DEFAULT_REDUNDANCY,
            context_timeout_secs: constants::CONTEXT_TIMEOUT_SECS,
        }
    }
}

/// Location verification policy and geolocation service.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub threshold_km: f64,
    pub geo_base_url: String,
    pub geo_token: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            threshold_km: constants::DISTANCE_THRESHOLD_KM,
            geo_base_url: constants::DEFAULT_GEO_BASE_URL.into(),
            geo_token: None,
        }
    }
}

/// Remote workflow CLI settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub enabled: bool,
    pub cli: String,
    /// Directory the CLI runs in.
    pub project_dir: PathBuf,
    /// Workflow directory inside `project_dir`; also the simulate target.
    pub workflow_dir: String,
    pub target: String,
    pub timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            enabled: true,
            cli: "cre".into(),
            project_dir: PathBuf::from("../chainlink"),
            workflow_dir: "verifi-workflow".into(),
            target: "staging-settings".into(),
            timeout_secs: constants::WORKFLOW_TIMEOUT_SECS,
        }
    }
}

impl VerifiConfig {
    /// Load configuration from `path`.
    /// Returns `Default` if the file doesn't exist or fails to parse.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Server listen address. Falls back to the default port on a bad host.
    pub fn listen_addr(&self) -> SocketAddr {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], constants::DEFAULT_RPC_PORT)))
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.sources.timeout_secs)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_secs(self.consensus.context_timeout_secs)
    }
}

const ARCHIVE_GATEWAY: &str = "https://calibnet.pspsps.io/ipfs/";

/// The published measurement archives, keyed by the IPFS root CID that
/// gateways serve.
pub fn default_archives() -> Vec<ArchiveSource> {
    [
        ("bafybeie3k3hqe445fxunrbzzrtesx6vyfdqj6g6vjhpknvi5tge4ofji2y", "airport-free-wifi-2025-11-22T12-25-00Z.json.car"),
        ("bafybeiapjwpp5wyvogsu2redlzgzi6hl5tb2b3fg5glmsut7sgahcjsq6i", "airport-free-wifi-2025-11-22T14-30-00Z.json.car"),
        ("bafybeibj4zv6upqppltr2haxus667lvmxiicaxuqibulfiwdig4oylnqtm", "coffeeshop-wifi-2025-11-22T12-23-00Z.json.car"),
        ("bafybeifwitmpyfdbacdncvwbuririyhwl4t7xyppa7z3y5l7eh7qhlvoiq", "coffeeshop-wifi-2025-11-22T13-15-00Z.json.car"),
        ("bafybeiag647lgvfroip2kz5keckez4yuo22spj6lbriguveme43guqqtwu", "library-public-2025-11-22T12-27-00Z.json.car"),
        ("bafybeibjzqvmhyxir3qbqi5zvk2r7qghdnkd45pbceniu3o5ojhkuv24vu", "library-public-2025-11-22T15-45-00Z.json.car"),
        ("bafybeie6yujbcxggkjpgqxjcjtg563yppandouez3tokc4leje7yk7a5cq", "sydney-cafe-2025-11-22T12-32-00Z.json.car"),
        ("bafybeihlr5ieepjy3jkz2j232ndxu4bvekwcozurkyqknbpmuz4rrsoxka", "tokyo-station-free-2025-11-22T12-30-00Z.json.car"),
    ]
    .into_iter()
    .map(|(root_cid, filename)| {
        ArchiveSource::new(
            root_cid,
            format!("{}{}?filename={}", ARCHIVE_GATEWAY, root_cid, filename),
            filename,
        )
    })
    .collect()
}
