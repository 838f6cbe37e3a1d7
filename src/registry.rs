//! The broker-producer registry (spec.md §4.7): a mutex-protected pair of
//! maps shared by every partition producer, refcounting access to each
//! broker's aggregator input channel.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use crate::{
    aggregator::Aggregator,
    collaborators::{BrokerEndpoint, BrokerId},
    config::ProducerConfig,
    flusher::Flusher,
    message::ProducerMessage,
    producer::{spawn_supervised, ReturnChannels},
};

/// A channel of individual messages into one broker's aggregator.
type AggregatorSender = flume::Sender<ProducerMessage>;

struct Inner {
    /// broker id -> current aggregator input channel for that broker.
    channels: HashMap<BrokerId, AggregatorSender>,
    /// broker id -> number of partition producers currently holding a
    /// reference to `channels[id]`.
    refcounts: HashMap<BrokerId, usize>,
}

/// Shared registry of per-broker aggregator+flusher pipelines.
#[derive(Clone)]
pub struct BrokerProducerRegistry {
    inner: Arc<Mutex<Inner>>,
    config: Arc<ProducerConfig>,
    returns: ReturnChannels,
    retry_tx: flume::Sender<ProducerMessage>,
    task_manager: task::TaskManager,
}

impl BrokerProducerRegistry {
    /// Creates an empty registry.
    pub fn new(
        config: Arc<ProducerConfig>,
        returns: ReturnChannels,
        retry_tx: flume::Sender<ProducerMessage>,
        task_manager: task::TaskManager,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                channels: HashMap::new(),
                refcounts: HashMap::new(),
            })),
            config,
            returns,
            retry_tx,
            task_manager,
        }
    }

    /// Returns the aggregator input channel for `broker`, creating a new
    /// aggregator+flusher pipeline on first use, and incrementing its
    /// refcount.
    pub fn get_broker_producer(&self, broker: Arc<dyn BrokerEndpoint>) -> AggregatorSender {
        let id = broker.id();
        let mut inner = self.inner.lock().expect("broker producer registry poisoned");

        if let Some(sender) = inner.channels.get(&id) {
            let sender = sender.clone();
            *inner.refcounts.entry(id).or_insert(0) += 1;
            return sender;
        }

        let (batch_tx, batch_rx) = flume::bounded::<Vec<ProducerMessage>>(self.config.channel_buffer_size);
        let (msg_tx, msg_rx) = flume::bounded::<ProducerMessage>(self.config.channel_buffer_size);

        let aggregator = Aggregator::new(msg_rx, batch_tx.clone(), self.config.clone());
        let mut task_manager = self.task_manager.clone();
        let aggregator_labels = task::labels::TaskLabels::new("aggregator", &id.to_string(), "broker-producer-registry");
        spawn_supervised(&mut task_manager, aggregator_labels, self.returns.clone(), aggregator.run());

        let flusher = Flusher::new(
            batch_rx,
            broker,
            self.config.clone(),
            self.returns.clone(),
            self.retry_tx.clone(),
            self.clone(),
        );
        let flusher_labels = task::labels::TaskLabels::new("flusher", &id.to_string(), "broker-producer-registry");
        spawn_supervised(&mut task_manager, flusher_labels, self.returns.clone(), flusher.run());

        let _ = inner.channels.insert(id, msg_tx.clone());
        let _ = inner.refcounts.insert(id, 1);

        msg_tx
    }

    /// Releases one reference to `sender`. When the refcount for `id`
    /// reaches zero, the sender is removed from the registry; the channel
    /// itself closes once every clone (including `sender`, consumed here)
    /// is dropped. The broker map entry is only removed if it still points
    /// to `sender` — `abandon_broker_connection` may have already replaced
    /// it.
    pub fn unref_broker_producer(&self, id: BrokerId, sender: AggregatorSender) {
        let mut inner = self.inner.lock().expect("broker producer registry poisoned");

        let remaining = match inner.refcounts.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };

        if remaining == 0 {
            let _ = inner.refcounts.remove(&id);
            if inner.channels.get(&id).map(|c| c.same_channel(&sender)).unwrap_or(false) {
                let _ = inner.channels.remove(&id);
            }
        }

        drop(sender);
    }

    /// Removes `id` from the broker map without touching refcounts.
    /// Existing holders keep draining their current batch; the next
    /// `get_broker_producer(id)` call builds a fresh pipeline.
    pub fn abandon_broker_connection(&self, id: BrokerId) {
        let mut inner = self.inner.lock().expect("broker producer registry poisoned");
        let _ = inner.channels.remove(&id);
    }

    /// Number of brokers with a live aggregator+flusher pipeline. Test-only
    /// observability, mirroring spec.md §8's invariants about registry
    /// state.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("broker producer registry poisoned").channels.len()
    }
}
