//! The per-topic producer (spec.md §4.2): assigns a partition to each fresh
//! message via the partitioner, then forwards to the partition producer.

use std::{collections::HashMap, sync::Arc};

use task::{labels::TaskLabels, TaskManager};

use crate::{
    circuit_breaker::CircuitBreaker,
    collaborators::{MetadataClient, Partitioner},
    config::ProducerConfig,
    error::{MetadataError, PartitionerError, ProduceError},
    in_flight::InFlight,
    message::ProducerMessage,
    partition_producer::PartitionProducer,
    producer::{spawn_supervised, ReturnChannels},
    registry::BrokerProducerRegistry,
};

/// Consumes messages for one topic.
pub struct TopicProducer {
    topic: String,
    input: flume::Receiver<ProducerMessage>,
    in_flight: InFlight,
    metadata: Arc<dyn MetadataClient>,
    partitioner: Arc<dyn Partitioner>,
    registry: BrokerProducerRegistry,
    returns: ReturnChannels,
    retry_tx: flume::Sender<ProducerMessage>,
    config: Arc<ProducerConfig>,
    task_manager: TaskManager,
    circuit_breaker: CircuitBreaker,
    partition_producers: HashMap<i32, flume::Sender<ProducerMessage>>,
}

impl TopicProducer {
    /// Creates a topic producer for `topic` consuming `input`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        input: flume::Receiver<ProducerMessage>,
        in_flight: InFlight,
        metadata: Arc<dyn MetadataClient>,
        partitioner: Arc<dyn Partitioner>,
        registry: BrokerProducerRegistry,
        returns: ReturnChannels,
        retry_tx: flume::Sender<ProducerMessage>,
        config: Arc<ProducerConfig>,
        task_manager: TaskManager,
    ) -> Self {
        Self {
            topic,
            input,
            in_flight,
            metadata,
            partitioner,
            registry,
            returns,
            retry_tx,
            config,
            task_manager,
            circuit_breaker: CircuitBreaker::new(),
            partition_producers: HashMap::new(),
        }
    }

    /// Runs until the input channel closes, then drops every partition
    /// producer's sender.
    pub async fn run(mut self) {
        while let Ok(msg) = self.input.recv_async().await {
            self.handle(msg).await;
        }
        tracing::debug!(topic = %self.topic, "topic producer input closed, draining partition producers");
    }

    async fn handle(&mut self, mut msg: ProducerMessage) {
        // A fresh user message never carries a partition; a retried message
        // or a chaser always does, so partition assignment runs at most once
        // per message regardless of how its `retries` counter reads.
        if msg.partition.is_none() {
            match self.assign_partition(&msg).await {
                Ok(partition) => msg.partition = Some(partition),
                Err(err) => {
                    self.returns.error(msg, err).await;
                    return;
                }
            }
        }

        let partition = msg.partition.expect("partition assigned above");
        let sender = self.partition_producer(partition);
        if sender.send_async(msg).await.is_err() {
            tracing::warn!(topic = %self.topic, partition, "partition producer input closed immediately after creation");
        }
    }

    async fn assign_partition(&self, msg: &ProducerMessage) -> Result<i32, ProduceError> {
        if !self.circuit_breaker.allow() {
            return Err(ProduceError::Metadata(MetadataError::CircuitOpen { topic: self.topic.clone() }));
        }

        let partitions = if self.partitioner.requires_consistency() {
            self.metadata.partitions(&self.topic).await
        } else {
            self.metadata.writable_partitions(&self.topic).await
        };

        let partitions = match partitions {
            Ok(partitions) => partitions,
            Err(err) => {
                self.circuit_breaker.record_failure();
                return Err(ProduceError::Metadata(err));
            }
        };

        if partitions.is_empty() {
            self.circuit_breaker.record_failure();
            return Err(ProduceError::Metadata(MetadataError::NoPartitions { topic: self.topic.clone() }));
        }

        match self.partitioner.partition(msg, partitions.len()).await {
            Ok(index) if index >= 0 && (index as usize) < partitions.len() => {
                self.circuit_breaker.record_success();
                Ok(partitions[index as usize])
            }
            Ok(index) => {
                self.circuit_breaker.record_failure();
                Err(ProduceError::Partitioner(PartitionerError::InvalidPartition {
                    topic: self.topic.clone(),
                    partition: index,
                    num_partitions: partitions.len(),
                }))
            }
            Err(err) => {
                self.circuit_breaker.record_failure();
                Err(ProduceError::Partitioner(err))
            }
        }
    }

    fn partition_producer(&mut self, partition: i32) -> flume::Sender<ProducerMessage> {
        if let Some(sender) = self.partition_producers.get(&partition) {
            return sender.clone();
        }

        let (tx, rx) = flume::bounded(self.config.channel_buffer_size);
        let partition_producer = PartitionProducer::new(
            self.topic.clone(),
            partition,
            rx,
            self.in_flight.clone(),
            self.metadata.clone(),
            self.registry.clone(),
            self.returns.clone(),
            self.retry_tx.clone(),
            self.config.clone(),
        );

        let mut task_manager = self.task_manager.clone();
        let labels = TaskLabels::new("partition-producer", &format!("{}-{partition}", self.topic), "topic-producer");
        spawn_supervised(&mut task_manager, labels, self.returns.clone(), partition_producer.run());

        let _ = self.partition_producers.insert(partition, tx.clone());
        tx
    }
}
