//! Static cluster membership.

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use log;
use serde::Deserialize;

/// Node identifier. Identifiers of a cluster are dense: `0..cluster_size`.
pub type NodeId = u32;

/// Cluster configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file reading error.
    IO(io::Error),
    /// Configuration format error.
    Parse(serde_yaml::Error),
    /// Cluster contains no nodes.
    Empty,
    /// Node identifier is declared more than once.
    DuplicateId(NodeId),
    /// Node identifiers do not form the dense range `0..cluster_size`.
    SparseIds(NodeId),
    /// Node port is not a valid TCP port.
    InvalidPort(NodeId, String),
    /// Local node is not declared in the cluster.
    UnknownNode(NodeId),
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ConfigError::IO(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ConfigError::IO(err) => write!(f, "cluster config not read: {}", err),
            ConfigError::Parse(err) => write!(f, "cluster config format error: {}", err),
            ConfigError::Empty => write!(f, "cluster config declares no servers"),
            ConfigError::DuplicateId(id) => write!(f, "server {} declared more than once", id),
            ConfigError::SparseIds(id) => write!(f, "server ids must be 0..n, found {}", id),
            ConfigError::InvalidPort(id, port) => write!(f, "server {} has invalid port '{}'", id, port),
            ConfigError::UnknownNode(id) => write!(f, "server {} is not declared in the cluster config", id),
        }
    }
}

/// Cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Node {
    /// Returns the `host:port` address of the node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct ClusterFile {
    servers: Vec<ServerEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEntry {
    server_id: NodeId,
    host: String,
    port: PortValue,
}

// deployment files quote the port
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

/// Fixed list of the nodes taking part in a run.
#[derive(Debug, Clone)]
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Creates a cluster validating that node ids are unique and dense. Nodes are ordered by id.
    pub fn new(mut nodes: Vec<Node>) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut ids = BTreeSet::new();
        for node in &nodes {
            if !ids.insert(node.id) {
                return Err(ConfigError::DuplicateId(node.id));
            }
        }
        if let Some(id) = ids.iter().find(|id| **id as usize >= nodes.len()) {
            return Err(ConfigError::SparseIds(*id));
        }

        nodes.sort_by_key(|node| node.id);
        return Ok(Cluster { nodes });
    }

    /// Loads a cluster from a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::IO)?;
        let cluster = Self::from_yaml(&content)?;

        log::info!("loaded cluster config {} ({} servers)", path.display(), cluster.size());
        return Ok(cluster);
    }

    /// Parses a cluster from a YAML document of the form `servers: [{serverId, host, port}]`.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: ClusterFile = serde_yaml::from_str(content).map_err(ConfigError::Parse)?;

        let nodes = file
            .servers
            .into_iter()
            .map(|entry| {
                let port = match entry.port {
                    PortValue::Number(port) => port,
                    PortValue::Text(port) => port
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(entry.server_id, port.clone()))?,
                };
                Ok(Node {
                    id: entry.server_id,
                    host: entry.host,
                    port,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Self::new(nodes)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, ConfigError> {
        self.nodes.get(id as usize).ok_or(ConfigError::UnknownNode(id))
    }

    /// Returns all nodes except the given one.
    pub fn peers(&self, local: NodeId) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |node| node.id != local)
    }
}
