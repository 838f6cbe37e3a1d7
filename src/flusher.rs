//! Per-broker flusher (spec.md §4.5): issues produce RPCs for each batch the
//! aggregator hands it, classifies the response, and routes every message to
//! its terminal disposition — success, error, or retry.

use std::{collections::HashMap, sync::Arc};

use crate::{
    collaborators::BrokerEndpoint,
    config::ProducerConfig,
    error::{BrokerError, ProduceError, ResponseError},
    message::ProducerMessage,
    registry::BrokerProducerRegistry,
    request::{build_request, ProduceResponse},
};

type MsgSets = HashMap<String, HashMap<i32, Vec<ProducerMessage>>>;

/// One running instance, owning the produce loop for one broker.
pub struct Flusher {
    input: flume::Receiver<Vec<ProducerMessage>>,
    broker: Arc<dyn BrokerEndpoint>,
    config: Arc<ProducerConfig>,
    returns: crate::producer::ReturnChannels,
    retry_tx: flume::Sender<ProducerMessage>,
    registry: BrokerProducerRegistry,
    /// Partitions currently being rehabilitated: topic -> partition -> the
    /// stored cause, suppressing produce attempts until their chaser proves
    /// the retry round complete.
    current_retries: HashMap<String, HashMap<i32, ResponseError>>,
    /// Set once a transport error has closed the broker connection; every
    /// later batch is retried wholesale without attempting another RPC.
    closing: Option<String>,
}

impl Flusher {
    /// Creates a flusher consuming batches from `input` and targeting
    /// `broker`.
    pub fn new(
        input: flume::Receiver<Vec<ProducerMessage>>,
        broker: Arc<dyn BrokerEndpoint>,
        config: Arc<ProducerConfig>,
        returns: crate::producer::ReturnChannels,
        retry_tx: flume::Sender<ProducerMessage>,
        registry: BrokerProducerRegistry,
    ) -> Self {
        Self {
            input,
            broker,
            config,
            returns,
            retry_tx,
            registry,
            current_retries: HashMap::new(),
            closing: None,
        }
    }

    /// Runs until the upstream aggregator closes its batch channel.
    pub async fn run(mut self) {
        while let Ok(batch) = self.input.recv_async().await {
            self.handle_batch(batch).await;
        }
        tracing::debug!(broker = self.broker.id(), "flusher input closed, exiting");
    }

    async fn handle_batch(&mut self, batch: Vec<ProducerMessage>) {
        if let Some(cause) = self.closing.clone() {
            for msg in batch {
                self.retry(msg, Some(cause.clone())).await;
            }
            return;
        }

        let msg_sets = self.group_and_filter(batch).await;

        let Some(request) = build_request(&msg_sets, &self.config) else {
            return;
        };

        match self.broker.produce(request).await {
            Ok(None) => self.return_all_successes(msg_sets).await,
            Ok(Some(response)) => self.parse_response(msg_sets, response).await,
            Err(BrokerError::Encoding(reason)) => {
                self.return_all_errors(msg_sets, ProduceError::RequestEncoding(reason)).await;
            }
            Err(err @ BrokerError::Transport(_)) => self.handle_transport_error(msg_sets, err).await,
        }
    }

    /// spec.md §4.5 step 2: routes rehabilitated and unencodable messages to
    /// their terminal disposition immediately, returning only the messages
    /// that will actually be produced.
    async fn group_and_filter(&mut self, batch: Vec<ProducerMessage>) -> MsgSets {
        let mut msg_sets: MsgSets = HashMap::new();

        for mut msg in batch {
            let partition = msg.partition.expect("message reaching the flusher must already have a partition");
            let stored = self.current_retries.get(&msg.topic).and_then(|p| p.get(&partition)).copied();

            if let Some(stored_err) = stored {
                if msg.is_chaser() {
                    if let Some(partitions) = self.current_retries.get_mut(&msg.topic) {
                        let _ = partitions.remove(&partition);
                        if partitions.is_empty() {
                            let _ = self.current_retries.remove(&msg.topic);
                        }
                    }
                }
                self.retry(msg, Some(stored_err.to_string())).await;
                continue;
            }

            if let Err(err) = msg.ensure_encoded() {
                self.returns.error(msg, ProduceError::Encode(err)).await;
                continue;
            }

            msg_sets.entry(msg.topic.clone()).or_default().entry(partition).or_default().push(msg);
        }

        msg_sets
    }

    async fn return_all_successes(&mut self, msg_sets: MsgSets) {
        for (_, partitions) in msg_sets {
            for (_, messages) in partitions {
                for msg in messages {
                    self.dispose_success(msg).await;
                }
            }
        }
    }

    async fn return_all_errors(&mut self, msg_sets: MsgSets, err: ProduceError) {
        for (_, partitions) in msg_sets {
            for (_, messages) in partitions {
                for msg in messages {
                    self.returns.error(msg, err.clone()).await;
                }
            }
        }
    }

    async fn handle_transport_error(&mut self, msg_sets: MsgSets, err: BrokerError) {
        let id = self.broker.id();
        self.registry.abandon_broker_connection(id);

        let broker = self.broker.clone();
        tokio::spawn(async move {
            if let Err(close_err) = broker.close().await {
                tracing::warn!(broker = id, error = %close_err, "error closing abandoned broker connection");
            }
        });

        let cause = err.to_string();
        self.closing = Some(cause.clone());

        for (_, partitions) in msg_sets {
            for (_, messages) in partitions {
                for msg in messages {
                    self.retry(msg, Some(cause.clone())).await;
                }
            }
        }
    }

    /// spec.md §4.5 step 5: iterates partitions from the request, not the
    /// response, so a missing block is itself an `ErrIncompleteResponse`.
    async fn parse_response(&mut self, msg_sets: MsgSets, response: ProduceResponse) {
        for (topic, partitions) in msg_sets {
            for (partition, messages) in partitions {
                let block = response.blocks.get(&topic).and_then(|p| p.get(&partition)).copied();

                match block {
                    None => {
                        for msg in messages {
                            self.returns.error(msg, ProduceError::IncompleteResponse).await;
                        }
                    }
                    Some(block) if matches!(block.error, ResponseError::NoError) => {
                        for (i, mut msg) in messages.into_iter().enumerate() {
                            msg.offset = Some(block.base_offset + i as i64);
                            self.dispose_success(msg).await;
                        }
                    }
                    Some(block) if block.error.is_retriable() => {
                        let _ = self
                            .current_retries
                            .entry(topic.clone())
                            .or_default()
                            .insert(partition, block.error);
                        for msg in messages {
                            self.retry(msg, Some(block.error.to_string())).await;
                        }
                    }
                    Some(block) => {
                        for msg in messages {
                            self.returns.error(msg, ProduceError::Response(block.error)).await;
                        }
                    }
                }
            }
        }
    }

    /// A message that the broker accepted (or that a fire-and-forget
    /// request implicitly accepted). A chaser is never delivered as a
    /// success: its acceptance is exactly the proof its partition producer
    /// is waiting for, and it can only reach that partition producer again
    /// by flowing back through the retry cycle.
    async fn dispose_success(&mut self, msg: ProducerMessage) {
        if msg.is_chaser() {
            self.retry(msg, None).await;
        } else {
            self.returns.success(msg).await;
        }
    }

    /// Routes `msg` back onto the retry channel. Chasers carry a
    /// level-identifying `retries` value, not an attempt count, so they
    /// bypass the retry-ceiling check entirely; ordinary messages are
    /// exhausted once `retries` exceeds `Retry.Max`.
    async fn retry(&mut self, mut msg: ProducerMessage, cause: Option<String>) {
        if !msg.is_chaser() {
            msg.retries += 1;
            if msg.retries > self.config.retry.max {
                let attempts = msg.retries;
                self.returns.error(msg, ProduceError::RetriesExhausted { attempts }).await;
                return;
            }
            msg.clear_encoded();
        }

        if let Some(cause) = cause {
            tracing::debug!(topic = %msg.topic, partition = ?msg.partition, cause = %cause, "routing message to retry");
        }

        if self.retry_tx.send_async(msg).await.is_err() {
            tracing::warn!("retry channel closed while routing a message for retry, message dropped");
        }
    }
}
