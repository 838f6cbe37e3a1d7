//! The singleton dispatcher (spec.md §4.1): per-message admission control
//! ahead of topic-level routing.

use std::{collections::HashMap, sync::Arc};

use task::{labels::TaskLabels, TaskManager};

use crate::{
    collaborators::{MetadataClient, Partitioner},
    config::ProducerConfig,
    error::ProduceError,
    in_flight::InFlight,
    message::ProducerMessage,
    producer::{spawn_supervised, ReturnChannels},
    registry::BrokerProducerRegistry,
    topic_producer::TopicProducer,
};

/// Consumes the user input channel and routes admitted messages to their
/// topic producer, creating one lazily on first use.
pub struct Dispatcher {
    input: flume::Receiver<ProducerMessage>,
    topic_producers: HashMap<String, flume::Sender<ProducerMessage>>,
    in_flight: InFlight,
    returns: ReturnChannels,
    config: Arc<ProducerConfig>,
    metadata: Arc<dyn MetadataClient>,
    partitioner: Arc<dyn Partitioner>,
    registry: BrokerProducerRegistry,
    retry_tx: flume::Sender<ProducerMessage>,
    task_manager: TaskManager,
    shutting_down: bool,
}

impl Dispatcher {
    /// Creates a dispatcher consuming `input`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: flume::Receiver<ProducerMessage>,
        in_flight: InFlight,
        returns: ReturnChannels,
        config: Arc<ProducerConfig>,
        metadata: Arc<dyn MetadataClient>,
        partitioner: Arc<dyn Partitioner>,
        registry: BrokerProducerRegistry,
        retry_tx: flume::Sender<ProducerMessage>,
        task_manager: TaskManager,
    ) -> Self {
        Self {
            input,
            topic_producers: HashMap::new(),
            in_flight,
            returns,
            config,
            metadata,
            partitioner,
            registry,
            retry_tx,
            task_manager,
            shutting_down: false,
        }
    }

    /// Runs until the input channel closes, then drops every topic
    /// producer's sender, cascading shutdown downstream.
    pub async fn run(mut self) {
        while let Ok(msg) = self.input.recv_async().await {
            self.handle(msg).await;
        }
        tracing::debug!("dispatcher input closed, draining topic producers");
    }

    async fn handle(&mut self, mut msg: ProducerMessage) {
        if msg.is_shutdown() {
            self.shutting_down = true;
            msg.dispose_in_flight();
            return;
        }

        if msg.retries == 0 {
            if self.shutting_down {
                self.returns.error(msg, ProduceError::ShuttingDown).await;
                return;
            }
            msg.admit(&self.in_flight);
        }

        if self.exceeds_size(&msg) {
            self.returns.error(msg, ProduceError::MessageSizeTooLarge).await;
            return;
        }

        let sender = self.topic_producer_for(&msg.topic);
        if sender.send_async(msg).await.is_err() {
            tracing::warn!("topic producer input closed immediately after creation");
        }
    }

    fn exceeds_size(&self, msg: &ProducerMessage) -> bool {
        let value_len = msg.value.as_ref().map_or(0, |v| v.length());

        (!self.config.compression.is_enabled() && value_len > self.config.max_message_bytes) || msg.size() > self.config.max_message_bytes
    }

    fn topic_producer_for(&mut self, topic: &str) -> flume::Sender<ProducerMessage> {
        if let Some(sender) = self.topic_producers.get(topic) {
            return sender.clone();
        }

        let (tx, rx) = flume::bounded(self.config.channel_buffer_size);
        let topic_producer = TopicProducer::new(
            topic.to_string(),
            rx,
            self.in_flight.clone(),
            self.metadata.clone(),
            self.partitioner.clone(),
            self.registry.clone(),
            self.returns.clone(),
            self.retry_tx.clone(),
            self.config.clone(),
            self.task_manager.clone(),
        );

        let mut task_manager = self.task_manager.clone();
        let labels = TaskLabels::new("topic-producer", topic, "dispatcher");
        spawn_supervised(&mut task_manager, labels, self.returns.clone(), topic_producer.run());

        let _ = self.topic_producers.insert(topic.to_string(), tx.clone());
        tx
    }
}
