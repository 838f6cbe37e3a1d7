//! Contracts for the collaborators the producer core consumes but does not
//! implement (spec.md §1, §6): cluster metadata, broker connections, and
//! partitioner plugins. Production code supplies real implementations;
//! tests supply mocks (see `tests/support.rs`).

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{BrokerError, MetadataError, PartitionerError},
    message::ProducerMessage,
    request::{ProduceRequest, ProduceResponse},
};

/// The stable identity of a broker in the cluster, as reported by
/// [`BrokerEndpoint::id`].
pub type BrokerId = i32;

/// A fallible, refreshable directory of topic/partition/leader metadata.
///
/// Out of scope per spec.md §1: the producer core never talks to the
/// cluster directly; it only calls through this trait.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// All partitions of `topic`.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MetadataError>;

    /// Only the partitions of `topic` currently writable.
    async fn writable_partitions(&self, topic: &str) -> Result<Vec<i32>, MetadataError>;

    /// The broker connection currently leading `topic`/`partition`.
    async fn leader(&self, topic: &str, partition: i32) -> Result<Arc<dyn BrokerEndpoint>, MetadataError>;

    /// Forces a metadata refresh for `topic`.
    async fn refresh_metadata(&self, topic: &str) -> Result<(), MetadataError>;

    /// Whether the underlying client has already been closed.
    fn closed(&self) -> bool;

    /// Closes the underlying client. Only called by the producer if it
    /// created the client itself.
    async fn close(&self) -> Result<(), MetadataError>;
}

/// A synchronous-per-call request/response endpoint for one broker.
///
/// Out of scope per spec.md §1: wire serialization and the transport
/// itself are the endpoint's business, not the producer core's.
#[async_trait]
pub trait BrokerEndpoint: Send + Sync {
    /// The broker's stable identity, used as the registry key.
    fn id(&self) -> BrokerId;

    /// Issues a produce request. `Ok(None)` means the server will never
    /// reply (required-acks = no-response); the request counts as
    /// successful as soon as it did not fail to encode or transport.
    async fn produce(&self, request: ProduceRequest) -> Result<Option<ProduceResponse>, BrokerError>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A pure function from message to partition index.
///
/// Out of scope per spec.md §1: the core ships no hash/round-robin/manual
/// implementation, only the contract.
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Returns the partition index to route `msg` to, out of
    /// `num_partitions` candidates.
    async fn partition(&self, msg: &ProducerMessage, num_partitions: usize) -> Result<i32, PartitionerError>;

    /// If true, the topic producer fetches *all* partitions of the topic
    /// before calling `partition`; otherwise it fetches only the writable
    /// ones.
    fn requires_consistency(&self) -> bool;
}
