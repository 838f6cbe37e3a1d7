#![deny(unsafe_code)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Core of an asynchronous producer client for a distributed commit-log
//! messaging system: a multi-stage in-process pipeline that routes
//! application messages to partition leaders, batches them per broker,
//! issues produce requests, classifies responses, and retries retriable
//! failures while preserving per-partition ordering.
//!
//! Cluster metadata, broker transport, wire serialization, and partition
//! assignment are all collaborator contracts ([`MetadataClient`],
//! [`BrokerEndpoint`], [`Encoder`], [`Partitioner`]); no concrete
//! implementation of any of them ships here.

mod aggregator;
mod circuit_breaker;
mod collaborators;
mod config;
mod dispatcher;
mod error;
mod flusher;
mod in_flight;
mod message;
mod partition_producer;
mod producer;
mod registry;
mod request;
mod retry_handler;
mod topic_producer;

pub use collaborators::{BrokerEndpoint, BrokerId, MetadataClient, Partitioner};
pub use config::{Compression, FlushConfig, ProducerConfig, RetryConfig, ReturnConfig};
pub use error::{BrokerError, EncodeError, MetadataError, PartitionerError, ProduceError, ProducerError, ResponseError, ShutdownErrors};
pub use message::{Encoder, ProducerMessage};
pub use producer::Producer;
pub use request::{MessageSetEntry, PartitionRequest, PartitionResponseBlock, ProduceRequest, ProduceResponse, RequiredAcks};
