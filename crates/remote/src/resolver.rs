use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
};

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, RemoteErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub String);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies which partition of the source service a call is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    Singleton,
    Int64(i64),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaSelector {
    #[default]
    Primary,
    RandomSecondary,
    RandomInstance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub role: ReplicaRole,
    /// listener name -> address
    pub listeners: BTreeMap<String, String>,
}

impl ResolvedEndpoint {
    /// An empty listener name picks the first listener the replica exposes.
    pub fn address(&self, listener: &str) -> Option<&str> {
        if listener.is_empty() {
            return self.listeners.values().next().map(String::as_str);
        }
        self.listeners.get(listener).map(String::as_str)
    }
}

/// Routing descriptor of a partition at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub partition_id: PartitionId,
    /// Increases every time the partition's replica set changes
    pub version: u64,
    pub endpoints: Vec<ResolvedEndpoint>,
}

impl ResolvedPartition {
    pub fn select(&self, selector: ReplicaSelector) -> Option<&ResolvedEndpoint> {
        let mut rng = rand::thread_rng();
        match selector {
            ReplicaSelector::Primary => self
                .endpoints
                .iter()
                .find(|endpoint| endpoint.role == ReplicaRole::Primary),
            ReplicaSelector::RandomSecondary => {
                let secondaries: Vec<&ResolvedEndpoint> = self
                    .endpoints
                    .iter()
                    .filter(|endpoint| endpoint.role == ReplicaRole::Secondary)
                    .collect();
                secondaries.choose(&mut rng).copied()
            }
            ReplicaSelector::RandomInstance => self.endpoints.choose(&mut rng),
        }
    }
}

// We need async_trait because the stabilized feature lacks support for object safety
// (i.e. dyn PartitionResolver)
#[async_trait::async_trait]
pub trait PartitionResolver: Debug + Send + Sync {
    /// Resolves the partition owning `key`. When `previous` is given the caller found it
    /// stale, and the resolver must return a newer descriptor than it.
    async fn resolve(
        &self,
        key: &PartitionKey,
        previous: Option<&ResolvedPartition>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedPartition, RemoteError>;
}

/// Resolves every key to a single primary at a fixed address.
#[derive(Debug, Clone)]
pub struct StaticPartitionResolver {
    partition_id: PartitionId,
    listener: String,
    address: String,
}

impl StaticPartitionResolver {
    pub fn new(
        partition_id: impl Into<String>,
        listener: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            partition_id: PartitionId(partition_id.into()),
            listener: listener.into(),
            address: address.into(),
        }
    }
}

#[async_trait::async_trait]
impl PartitionResolver for StaticPartitionResolver {
    async fn resolve(
        &self,
        _key: &PartitionKey,
        previous: Option<&ResolvedPartition>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedPartition, RemoteError> {
        if cancel.is_cancelled() {
            return Err(RemoteError::new(
                RemoteErrorKind::EndpointNotFound,
                "resolution cancelled",
            ));
        }
        let version = previous.map_or(1, |previous| previous.version + 1);
        Ok(ResolvedPartition {
            partition_id: self.partition_id.clone(),
            version,
            endpoints: vec![ResolvedEndpoint {
                role: ReplicaRole::Primary,
                listeners: BTreeMap::from([(self.listener.clone(), self.address.clone())]),
            }],
        })
    }
}
