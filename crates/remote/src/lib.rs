//! Resilient client for the migration source.
//!
//! Calls are routed to a partition of the source service through a cache of communication
//! clients, and failed calls are classified into transient failures, retried against the
//! same replica, and routing failures, retried after re-resolving the partition.

pub mod cache;
pub mod error;
pub mod http;
pub mod partition_client;
pub mod resolver;
pub mod retry;
pub mod source;

pub use cache::{ClientFactory, CommunicationClientFactory, ResolvedClient, SweepStats};
pub use error::{ClientError, RemoteError, RemoteErrorKind};
pub use http::{HttpSourceReplica, HttpSourceReplicaFactory};
pub use partition_client::ServicePartitionClient;
pub use resolver::{
    PartitionId, PartitionKey, PartitionResolver, ReplicaRole, ReplicaSelector,
    ResolvedEndpoint, ResolvedPartition, StaticPartitionResolver,
};
pub use retry::{
    ExceptionHandler, ExceptionHandlingResult, RetryDecision, RetryPolicy, RetrySettings,
    TransportExceptionHandler,
};
pub use source::{MigrationRecord, SourceReplica};
