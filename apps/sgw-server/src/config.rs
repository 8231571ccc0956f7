//! Gateway configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use serde::{Deserialize, Serialize};
use sgw_transport_grpc::backend::MAX_VBUCKETS;
use sgw_transport_grpc::MAX_MSG_SIZE;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Gateway configuration.
///
/// Example YAML:
/// ```yaml
/// data_addr: "0.0.0.0:18098"
/// sd_addr: "0.0.0.0:18099"
/// http_addr: "0.0.0.0:9090"
/// debug: false
/// tls:
///   cert_path: /etc/sgw/tls.crt
///   key_path: /etc/sgw/tls.key
/// cluster:
///   nodes:
///     - node_id: "node-a"
///       host_id: "10.0.1.10:11210"
///       server_group: "rack-1"
///   buckets: ["default", "travel-sample"]
///   num_vbuckets: 1024
///   num_replicas: 1
/// ```
///
/// Setting a listener address to `null` disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Data-plane listen address
    #[serde(default = "default_data_addr")]
    pub data_addr: Option<String>,

    /// Service-discovery listen address
    #[serde(default = "default_sd_addr")]
    pub sd_addr: Option<String>,

    /// HTTP health/metrics listen address
    #[serde(default)]
    pub http_addr: Option<String>,

    /// Log request metadata and outcomes for every call
    #[serde(default)]
    pub debug: bool,

    /// Largest accepted inbound message, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,

    /// PEM private key
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster members
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,

    /// Buckets present at startup
    #[serde(default = "default_buckets")]
    pub buckets: Vec<String>,

    /// Partitions per bucket
    #[serde(default = "default_num_vbuckets")]
    pub num_vbuckets: u32,

    /// Replica copies per partition
    #[serde(default = "default_num_replicas")]
    pub num_replicas: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            buckets: default_buckets(),
            num_vbuckets: default_num_vbuckets(),
            num_replicas: default_num_replicas(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,

    /// Address clients connect to
    pub host_id: String,

    #[serde(default)]
    pub server_group: String,

    #[serde(default = "all_services")]
    pub services: Vec<NodeService>,
}

impl NodeConfig {
    pub fn new(node_id: &str, host_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            host_id: host_id.to_string(),
            server_group: String::new(),
            services: all_services(),
        }
    }

    pub fn has(&self, service: NodeService) -> bool {
        self.services.contains(&service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeService {
    Mgmt,
    Kv,
    Views,
    Query,
    Analytics,
    Search,
}

fn default_data_addr() -> Option<String> {
    Some("0.0.0.0:18098".to_string())
}

fn default_sd_addr() -> Option<String> {
    Some("0.0.0.0:18099".to_string())
}

fn default_max_message_size() -> usize {
    MAX_MSG_SIZE
}

fn default_nodes() -> Vec<NodeConfig> {
    vec![NodeConfig::new("node-0", "127.0.0.1:11210")]
}

fn default_buckets() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_num_vbuckets() -> u32 {
    1024
}

fn default_num_replicas() -> u32 {
    1
}

fn all_services() -> Vec<NodeService> {
    vec![
        NodeService::Mgmt,
        NodeService::Kv,
        NodeService::Views,
        NodeService::Query,
        NodeService::Analytics,
        NodeService::Search,
    ]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_addr: default_data_addr(),
            sd_addr: default_sd_addr(),
            http_addr: None,
            debug: false,
            max_message_size: default_max_message_size(),
            tls: None,
            cluster: ClusterConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - SGW_DATA_ADDR (empty disables the data plane)
    /// - SGW_SD_ADDR (empty disables the service-discovery plane)
    /// - SGW_HTTP_ADDR
    /// - SGW_DEBUG ("1" or "true")
    pub fn load_from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = |name: &str, default: Option<String>| match var(name) {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
            None => default,
        };

        let config = GatewayConfig {
            data_addr: addr("SGW_DATA_ADDR", default_data_addr()),
            sd_addr: addr("SGW_SD_ADDR", default_sd_addr()),
            http_addr: addr("SGW_HTTP_ADDR", None),
            debug: var("SGW_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let data = self.data_socket_addr()?;
        let sd = self.sd_socket_addr()?;
        self.http_socket_addr()?;

        if data.is_none() && sd.is_none() {
            return Err(ConfigError::InvalidField(
                "at least one of data_addr and sd_addr must be set".to_string(),
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidField(
                "max_message_size must be > 0".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                return Err(ConfigError::MissingField("tls.cert_path/tls.key_path".to_string()));
            }
        }

        let cluster = &self.cluster;
        if cluster.num_vbuckets == 0 || cluster.num_vbuckets > MAX_VBUCKETS {
            return Err(ConfigError::InvalidField(format!(
                "num_vbuckets must be between 1 and {}",
                MAX_VBUCKETS
            )));
        }

        let mut seen = HashSet::new();
        for node in &cluster.nodes {
            if node.node_id.is_empty() {
                return Err(ConfigError::InvalidField("node_id cannot be empty".to_string()));
            }
            if !seen.insert(node.node_id.as_str()) {
                return Err(ConfigError::InvalidField(format!(
                    "duplicate node_id {}",
                    node.node_id
                )));
            }
        }

        if !cluster.nodes.iter().any(|n| n.has(NodeService::Kv)) {
            return Err(ConfigError::InvalidField(
                "cluster needs at least one kv node".to_string(),
            ));
        }

        if cluster.buckets.iter().any(|b| b.is_empty()) {
            return Err(ConfigError::InvalidField(
                "bucket names cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn data_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_addr("data_addr", self.data_addr.as_deref())
    }

    pub fn sd_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_addr("sd_addr", self.sd_addr.as_deref())
    }

    pub fn http_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_addr("http_addr", self.http_addr.as_deref())
    }
}

fn parse_addr(field: &str, addr: Option<&str>) -> Result<Option<SocketAddr>, ConfigError> {
    addr.map(|a| {
        a.parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidField(format!("Invalid {}: {}", field, e)))
    })
    .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}
