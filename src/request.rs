//! The produce request/response shapes and the request builder (spec.md
//! §4.6). Wire serialization itself is out of scope: these are in-memory
//! structures handed to a [`crate::collaborators::BrokerEndpoint`], which is
//! responsible for turning them into bytes.

use std::{collections::HashMap, time::Duration};

use crate::{config::ProducerConfig, message::ProducerMessage};

/// How many replicas must acknowledge a produce request before the broker
/// replies (spec.md §6, `Producer.RequiredAcks`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// The broker never replies; the request is fire-and-forget.
    NoResponse,
    /// Only the partition leader must acknowledge.
    Leader,
    /// All in-sync replicas must acknowledge.
    All,
}

/// One key/value pair as it will be framed on the wire.
#[derive(Debug, Clone, Default)]
pub struct MessageSetEntry {
    /// The encoded key, if any.
    pub key: Option<Vec<u8>>,
    /// The encoded value, if any.
    pub value: Option<Vec<u8>>,
}

/// One partition's contribution to a produce request.
///
/// `message_sets` holds one entry per wire-level message set: with
/// compression disabled this is always a single set containing every
/// message; with compression enabled each inner `Vec` is the batch that
/// was wrapped as a single compressed message once it reached
/// `MaxMessageBytes` (spec.md §4.6).
#[derive(Debug, Clone, Default)]
pub struct PartitionRequest {
    /// The partition this contribution targets.
    pub partition: i32,
    /// The message sets building up this partition's payload.
    pub message_sets: Vec<Vec<MessageSetEntry>>,
}

impl PartitionRequest {
    /// Total number of individual messages across all message sets, in the
    /// order they will be assigned consecutive offsets on success.
    pub fn message_count(&self) -> usize {
        self.message_sets.iter().map(Vec::len).sum()
    }
}

/// A produce request spanning possibly many topics and partitions.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// The acknowledgement level requested.
    pub required_acks: RequiredAcks,
    /// The server-side timeout for the request.
    pub timeout: Duration,
    /// topic -> partition contributions.
    pub topics: HashMap<String, Vec<PartitionRequest>>,
}

impl ProduceRequest {
    /// Whether this request carries any data at all.
    pub fn is_empty(&self) -> bool {
        self.topics.values().all(|partitions| partitions.is_empty())
    }
}

/// A single partition's block within a [`ProduceResponse`].
#[derive(Debug, Clone, Copy)]
pub struct PartitionResponseBlock {
    /// The error code this partition reported, `ResponseError::NoError` on
    /// success.
    pub error: crate::error::ResponseError,
    /// The offset assigned to the first message of the request, when
    /// `error` is `NoError`.
    pub base_offset: i64,
}

/// The broker's reply to a [`ProduceRequest`], or `None` when
/// `RequiredAcks::NoResponse` was used.
#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    /// topic -> partition -> response block.
    pub blocks: HashMap<String, HashMap<i32, PartitionResponseBlock>>,
}

/// Builds a produce request out of the per-topic, per-partition message
/// groups the flusher accumulated. Messages must already have their
/// key/value encoded and cached (spec.md §4.5 step 2). Returns `None` when
/// there is nothing to send.
///
/// Compression accounting: whenever adding the next message to the current
/// set would make it reach `config.max_message_bytes` (the compressed set
/// is itself wrapped as a single message subject to that limit), the
/// current set is closed and a fresh one is started.
pub fn build_request(
    msg_sets: &HashMap<String, HashMap<i32, Vec<ProducerMessage>>>,
    config: &ProducerConfig,
) -> Option<ProduceRequest> {
    let mut topics: HashMap<String, Vec<PartitionRequest>> = HashMap::new();

    for (topic, partitions) in msg_sets {
        let mut partition_requests = Vec::new();

        for (&partition, messages) in partitions {
            if messages.is_empty() {
                continue;
            }

            let message_sets = if config.compression.is_enabled() {
                group_for_compression(messages, config.max_message_bytes)
            } else {
                vec![messages.iter().map(to_entry).collect()]
            };

            partition_requests.push(PartitionRequest { partition, message_sets });
        }

        if !partition_requests.is_empty() {
            let _ = topics.insert(topic.clone(), partition_requests);
        }
    }

    if topics.values().all(Vec::is_empty) {
        return None;
    }

    Some(ProduceRequest {
        required_acks: config.required_acks,
        timeout: config.timeout,
        topics,
    })
}

fn to_entry(msg: &ProducerMessage) -> MessageSetEntry {
    MessageSetEntry {
        key: msg.encoded_key.clone(),
        value: msg.encoded_value.clone(),
    }
}

fn entry_size(entry: &MessageSetEntry) -> usize {
    crate::message::MESSAGE_OVERHEAD + entry.key.as_ref().map_or(0, Vec::len) + entry.value.as_ref().map_or(0, Vec::len)
}

fn group_for_compression(messages: &[ProducerMessage], max_message_bytes: usize) -> Vec<Vec<MessageSetEntry>> {
    let mut sets = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for msg in messages {
        let entry = to_entry(msg);
        let size = entry_size(&entry);

        if !current.is_empty() && current_bytes + size >= max_message_bytes {
            sets.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += size;
        current.push(entry);
    }

    if !current.is_empty() {
        sets.push(current);
    }

    sets
}
