//! Error taxonomy for the producer core, following spec.md §7.

use std::collections::HashMap;

use thiserror::Error;

use crate::message::ProducerMessage;

/// Failure to encode a key or value.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct EncodeError(pub String);

/// Errors surfaced by a [`crate::collaborators::MetadataClient`].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// The cluster reported zero partitions for the topic.
    #[error("no partitions available for topic `{topic}`")]
    NoPartitions {
        /// The topic that has no partitions.
        topic: String,
    },
    /// A metadata refresh or leader lookup failed for some other reason.
    #[error("metadata error (topic: {topic}, reason: {reason})")]
    Refresh {
        /// The topic the lookup was for.
        topic: String,
        /// The underlying error message.
        reason: String,
    },
    /// The circuit breaker guarding this operation is open.
    #[error("circuit breaker open for topic `{topic}`")]
    CircuitOpen {
        /// The topic the lookup was for.
        topic: String,
    },
}

/// Errors surfaced by a [`crate::collaborators::Partitioner`].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum PartitionerError {
    /// The partitioner returned an index outside `0..num_partitions`.
    #[error("partitioner returned out-of-range partition {partition} (topic: {topic}, num_partitions: {num_partitions})")]
    InvalidPartition {
        /// The topic being partitioned.
        topic: String,
        /// The out-of-range index returned.
        partition: i32,
        /// The number of partitions available.
        num_partitions: usize,
    },
    /// The partitioner itself failed.
    #[error("partitioner error (topic: {topic}, reason: {reason})")]
    Partitioner {
        /// The topic being partitioned.
        topic: String,
        /// The underlying error message.
        reason: String,
    },
}

/// Errors surfaced by a [`crate::collaborators::BrokerEndpoint`].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BrokerError {
    /// The request failed to encode before it ever reached the wire.
    #[error("request encoding failed: {0}")]
    Encoding(String),
    /// A transport/connection-level failure, distinct from encoding.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Per-partition error codes a broker can report in a produce response,
/// mirroring spec.md §4.5's response classification table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseError {
    /// No error: the partition accepted the batch.
    #[error("no error")]
    NoError,
    /// Retriable: the partition's leader moved or metadata is stale.
    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,
    /// Retriable.
    #[error("not leader for partition")]
    NotLeaderForPartition,
    /// Retriable.
    #[error("leader not available")]
    LeaderNotAvailable,
    /// Retriable.
    #[error("request timed out")]
    RequestTimedOut,
    /// Retriable.
    #[error("not enough replicas")]
    NotEnoughReplicas,
    /// Retriable.
    #[error("not enough replicas after append")]
    NotEnoughReplicasAfterAppend,
    /// Any other broker-reported error: a permanent, per-partition failure.
    #[error("broker error: {0}")]
    Other(&'static str),
}

impl ResponseError {
    /// Whether this response error should trigger per-partition retry
    /// (spec.md §4.5, step 5, "retriable set").
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ResponseError::UnknownTopicOrPartition
                | ResponseError::NotLeaderForPartition
                | ResponseError::LeaderNotAvailable
                | ResponseError::RequestTimedOut
                | ResponseError::NotEnoughReplicas
                | ResponseError::NotEnoughReplicasAfterAppend
        )
    }
}

/// The cause attached to a message or batch that could not be delivered.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ProduceError {
    /// Dispatcher size check failed.
    #[error("message size too large")]
    MessageSizeTooLarge,
    /// The topic producer's partitioner (or its metadata lookups) failed.
    #[error(transparent)]
    Partitioner(#[from] PartitionerError),
    /// The cluster reported zero partitions, or another metadata failure.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Encoding the key or value failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The produce request itself failed to encode.
    #[error("request encoding failed: {0}")]
    RequestEncoding(String),
    /// The response carried no block for this partition's request.
    #[error("incomplete response for partition")]
    IncompleteResponse,
    /// A non-retriable error reported by the broker for this partition.
    #[error(transparent)]
    Response(#[from] ResponseError),
    /// Submitted after (or during) shutdown; never admitted.
    #[error("producer is shutting down")]
    ShuttingDown,
    /// Exhausted `Retry.Max` attempts.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Total produce attempts made, including the first.
        attempts: u16,
    },
    /// A pipeline task hit an invariant violation it could not recover
    /// from. Surfaces once and tears the producer down; see SPEC_FULL.md's
    /// "fault recovery barrier redesign".
    #[error("fatal producer error: {0}")]
    Fatal(String),
    /// Catch-all for a broker-reported error outside the retriable set and
    /// outside the dedicated variants above.
    #[error("produce failed (reason: {error}, context: {context:?})")]
    Other {
        /// The error message.
        error: String,
        /// Additional diagnostic context.
        context: HashMap<String, String>,
    },
}

/// A `(message, cause)` pair, the unit of the error return path.
#[derive(Debug)]
pub struct ProducerError {
    /// The message that failed.
    pub msg: ProducerMessage,
    /// Why it failed.
    pub err: ProduceError,
}

/// The batch of errors returned by [`crate::Producer::close`].
#[derive(Debug, Error)]
#[error("producer closed with {} undelivered message(s)", .0.len())]
pub struct ShutdownErrors(pub Vec<ProducerError>);
