use std::collections::HashMap;

use tonic::transport::{Channel, Endpoint, Uri};

use crate::NodeError;

/// Configuration of a single storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub virtual_storage: String,
    pub storage: String,
    pub address: String,
}

/// A dialed storage node. The channel is created once at startup and shared
/// by every RPC routed to this node; it is never re-dialed per call.
#[derive(Clone)]
pub struct Node {
    pub virtual_storage: String,
    pub storage: String,
    pub address: String,
    pub channel: Channel,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("virtual_storage", &self.virtual_storage)
            .field("storage", &self.storage)
            .field("address", &self.address)
            .finish()
    }
}

/// Lazily dials a gRPC channel. `unix://` addresses connect through a Unix
/// socket connector; everything else is HTTP/2 over TCP (or TLS when the
/// scheme says so).
pub fn dial_channel(address: &str) -> Result<Channel, NodeError> {
    let invalid = |source| NodeError::InvalidEndpoint {
        address: address.to_string(),
        source,
    };

    let endpoint = Endpoint::from_shared(address.to_string())
        .map_err(invalid)?
        .connect_timeout(std::time::Duration::from_secs(5))
        .http2_keep_alive_interval(std::time::Duration::from_secs(30));

    let channel = if endpoint.uri().scheme_str() == Some("unix") {
        endpoint.connect_with_connector_lazy(tower::util::service_fn(|uri: Uri| async move {
            let stream = tokio::net::UnixStream::connect(uri.path()).await?;
            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
        }))
    } else {
        endpoint.connect_lazy()
    };
    Ok(channel)
}

/// All dialed nodes, grouped per virtual storage.
pub struct NodeSet {
    nodes: HashMap<String, Vec<Node>>,
}

impl NodeSet {
    /// Dials every configured node. Within a virtual storage, storage names
    /// must be unique.
    pub fn dial(configs: &[NodeConfig]) -> Result<Self, NodeError> {
        let mut nodes: HashMap<String, Vec<Node>> = HashMap::new();

        for config in configs {
            let members = nodes.entry(config.virtual_storage.clone()).or_default();
            if members.iter().any(|node| node.storage == config.storage) {
                return Err(NodeError::DuplicateStorage {
                    virtual_storage: config.virtual_storage.clone(),
                    storage: config.storage.clone(),
                });
            }
            members.push(Node {
                virtual_storage: config.virtual_storage.clone(),
                storage: config.storage.clone(),
                address: config.address.clone(),
                channel: dial_channel(&config.address)?,
            });
        }

        for members in nodes.values_mut() {
            members.sort_by(|a, b| a.storage.cmp(&b.storage));
        }
        Ok(Self { nodes })
    }

    pub fn get(&self, virtual_storage: &str, storage: &str) -> Result<&Node, NodeError> {
        self.nodes
            .get(virtual_storage)
            .and_then(|members| members.iter().find(|node| node.storage == storage))
            .ok_or_else(|| NodeError::UnknownStorage {
                virtual_storage: virtual_storage.to_string(),
                storage: storage.to_string(),
            })
    }

    pub fn contains_virtual_storage(&self, virtual_storage: &str) -> bool {
        self.nodes.contains_key(virtual_storage)
    }

    /// Nodes of one virtual storage, ordered by storage name.
    pub fn members(&self, virtual_storage: &str) -> &[Node] {
        self.nodes
            .get(virtual_storage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn virtual_storages(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().flatten()
    }

    /// Storage names per virtual storage, as the stores expect them.
    pub fn configured_storages(&self) -> HashMap<String, Vec<String>> {
        self.nodes
            .iter()
            .map(|(virtual_storage, members)| {
                (
                    virtual_storage.clone(),
                    members.iter().map(|node| node.storage.clone()).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(virtual_storage: &str, storage: &str) -> NodeConfig {
        NodeConfig {
            virtual_storage: virtual_storage.to_string(),
            storage: storage.to_string(),
            address: "http://127.0.0.1:1".to_string(),
        }
    }

    #[test]
    fn storages_are_unique_within_a_virtual_storage() {
        let err = NodeSet::dial(&[config("default", "node-a"), config("default", "node-a")])
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::DuplicateStorage { .. }));

        // The same storage name may appear in different virtual storages.
        let set = NodeSet::dial(&[config("default", "node-a"), config("other", "node-a")]).unwrap();
        assert!(set.get("default", "node-a").is_ok());
        assert!(set.get("other", "node-a").is_ok());
        assert!(set.get("default", "node-b").is_err());
    }

    #[test]
    fn members_are_ordered_by_storage_name() {
        let set = NodeSet::dial(&[
            config("default", "node-c"),
            config("default", "node-a"),
            config("default", "node-b"),
        ])
        .unwrap();

        let names: Vec<&str> = set
            .members("default")
            .iter()
            .map(|node| node.storage.as_str())
            .collect();
        assert_eq!(names, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let err = NodeSet::dial(&[NodeConfig {
            virtual_storage: "default".to_string(),
            storage: "node-a".to_string(),
            address: "not a uri".to_string(),
        }])
        .err()
        .unwrap();
        assert!(matches!(err, NodeError::InvalidEndpoint { .. }));
    }
}
