//! Mock collaborators for the producer integration tests, following the
//! style of `beaubourg`'s `tests/common` + per-component test factories:
//! hand-written, script-driven stand-ins rather than a mocking framework.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use commitlog_producer::{
    BrokerEndpoint, BrokerError, BrokerId, MetadataClient, MetadataError, PartitionResponseBlock, Partitioner, PartitionerError,
    ProduceRequest, ProduceResponse, ProducerMessage, ResponseError,
};

/// One scripted outcome for a single produce call against a [`MockBroker`].
#[derive(Clone)]
pub enum Outcome {
    /// Every partition in the request succeeds.
    Success,
    /// Fire-and-forget: the broker never replies.
    NoResponse,
    /// Every partition in the request comes back with a retriable error.
    Retriable(ResponseError),
    /// Every partition in the request comes back with a permanent error.
    Permanent(ResponseError),
    /// The call fails at the transport layer, before any response.
    Transport,
}

/// A broker endpoint that replays a fixed script of outcomes, one per
/// `produce` call, repeating the last entry once the script is exhausted.
pub struct MockBroker {
    id: BrokerId,
    script: Mutex<VecDeque<Outcome>>,
    next_offset: Mutex<HashMap<(String, i32), i64>>,
    pub produce_calls: AtomicUsize,
    pub closed: AtomicUsize,
}

impl MockBroker {
    pub fn new(id: BrokerId, script: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            id,
            script: Mutex::new(script.into()),
            next_offset: Mutex::new(HashMap::new()),
            produce_calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn always(id: BrokerId, outcome: Outcome) -> Arc<Self> {
        Self::new(id, vec![outcome])
    }

    fn next_outcome(&self) -> Outcome {
        let mut script = self.script.lock().expect("mock broker script poisoned");
        if script.len() > 1 {
            script.pop_front().expect("checked non-empty above")
        } else {
            script.front().cloned().unwrap_or(Outcome::Success)
        }
    }
}

#[async_trait]
impl BrokerEndpoint for MockBroker {
    fn id(&self) -> BrokerId {
        self.id
    }

    async fn produce(&self, request: ProduceRequest) -> Result<Option<ProduceResponse>, BrokerError> {
        let _ = self.produce_calls.fetch_add(1, Ordering::SeqCst);

        match self.next_outcome() {
            Outcome::Transport => Err(BrokerError::Transport("mock broker connection reset".to_string())),
            Outcome::NoResponse => Ok(None),
            Outcome::Success => {
                let mut response = ProduceResponse::default();
                let mut offsets = self.next_offset.lock().expect("mock broker offsets poisoned");
                for (topic, partitions) in &request.topics {
                    let blocks = response.blocks.entry(topic.clone()).or_default();
                    for partition_request in partitions {
                        let key = (topic.clone(), partition_request.partition);
                        let base_offset = *offsets.get(&key).unwrap_or(&0);
                        let _ = offsets.insert(key, base_offset + partition_request.message_count() as i64);
                        let _ = blocks.insert(
                            partition_request.partition,
                            PartitionResponseBlock {
                                error: ResponseError::NoError,
                                base_offset,
                            },
                        );
                    }
                }
                Ok(Some(response))
            }
            Outcome::Retriable(err) | Outcome::Permanent(err) => {
                let mut response = ProduceResponse::default();
                for (topic, partitions) in &request.topics {
                    let blocks = response.blocks.entry(topic.clone()).or_default();
                    for partition_request in partitions {
                        let _ = blocks.insert(partition_request.partition, PartitionResponseBlock { error: err, base_offset: 0 });
                    }
                }
                Ok(Some(response))
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let _ = self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Cluster metadata fixed at construction time: one topic's partitions all
/// led by the same broker (or by distinct brokers, when built with
/// [`MockMetadata::with_leaders`]).
pub struct MockMetadata {
    partitions: HashMap<String, Vec<i32>>,
    leaders: HashMap<(String, i32), Arc<dyn BrokerEndpoint>>,
}

impl MockMetadata {
    pub fn single_partition(topic: &str, broker: Arc<dyn BrokerEndpoint>) -> Arc<Self> {
        Self::with_leaders(topic, vec![(0, broker)])
    }

    pub fn with_leaders(topic: &str, partitions: Vec<(i32, Arc<dyn BrokerEndpoint>)>) -> Arc<Self> {
        let ids: Vec<i32> = partitions.iter().map(|(p, _)| *p).collect();
        let leaders = partitions.into_iter().map(|(p, broker)| ((topic.to_string(), p), broker)).collect();
        Arc::new(Self {
            partitions: HashMap::from([(topic.to_string(), ids)]),
            leaders,
        })
    }
}

#[async_trait]
impl MetadataClient for MockMetadata {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MetadataError> {
        self.partitions
            .get(topic)
            .cloned()
            .ok_or_else(|| MetadataError::NoPartitions { topic: topic.to_string() })
    }

    async fn writable_partitions(&self, topic: &str) -> Result<Vec<i32>, MetadataError> {
        self.partitions(topic).await
    }

    async fn leader(&self, topic: &str, partition: i32) -> Result<Arc<dyn BrokerEndpoint>, MetadataError> {
        self.leaders
            .get(&(topic.to_string(), partition))
            .cloned()
            .ok_or_else(|| MetadataError::Refresh {
                topic: topic.to_string(),
                reason: "no leader configured in mock metadata".to_string(),
            })
    }

    async fn refresh_metadata(&self, _topic: &str) -> Result<(), MetadataError> {
        Ok(())
    }

    fn closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Always routes to partition 0. Sufficient for every single-partition
/// scenario; multi-partition scenarios build their own.
pub struct FixedPartitioner(pub i32);

#[async_trait]
impl Partitioner for FixedPartitioner {
    async fn partition(&self, _msg: &ProducerMessage, _num_partitions: usize) -> Result<i32, PartitionerError> {
        Ok(self.0)
    }

    fn requires_consistency(&self) -> bool {
        false
    }
}
