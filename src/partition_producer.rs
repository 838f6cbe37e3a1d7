//! The partition producer and retry state machine (spec.md §4.3): the
//! component that guarantees per-partition ordering across an arbitrary
//! number of retry rounds, via the high-watermark/chaser protocol.

use std::sync::Arc;

use crate::{
    circuit_breaker::CircuitBreaker,
    collaborators::{BrokerEndpoint, MetadataClient},
    config::ProducerConfig,
    error::{MetadataError, ProduceError},
    in_flight::InFlight,
    message::ProducerMessage,
    producer::ReturnChannels,
    registry::BrokerProducerRegistry,
};

/// One retry level's deferred-message buffer and drain-detection flag.
#[derive(Default)]
struct RetryState {
    buf: Vec<ProducerMessage>,
    expect_chaser: bool,
}

/// Owns the ordering invariant for one topic-partition.
pub struct PartitionProducer {
    topic: String,
    partition: i32,
    input: flume::Receiver<ProducerMessage>,
    in_flight: InFlight,
    metadata: Arc<dyn MetadataClient>,
    registry: BrokerProducerRegistry,
    returns: ReturnChannels,
    retry_tx: flume::Sender<ProducerMessage>,
    config: Arc<ProducerConfig>,
    circuit_breaker: CircuitBreaker,

    leader: Option<Arc<dyn BrokerEndpoint>>,
    output: Option<flume::Sender<ProducerMessage>>,
    high_watermark: u16,
    retry_state: Vec<RetryState>,
}

impl PartitionProducer {
    /// Creates a partition producer for `topic`/`partition` consuming
    /// `input`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        partition: i32,
        input: flume::Receiver<ProducerMessage>,
        in_flight: InFlight,
        metadata: Arc<dyn MetadataClient>,
        registry: BrokerProducerRegistry,
        returns: ReturnChannels,
        retry_tx: flume::Sender<ProducerMessage>,
        config: Arc<ProducerConfig>,
    ) -> Self {
        let slots = config.retry.max as usize + 1;
        Self {
            topic,
            partition,
            input,
            in_flight,
            metadata,
            registry,
            returns,
            retry_tx,
            config,
            circuit_breaker: CircuitBreaker::new(),
            leader: None,
            output: None,
            high_watermark: 0,
            retry_state: (0..slots).map(|_| RetryState::default()).collect(),
        }
    }

    /// Runs the retry state machine until the input channel closes.
    pub async fn run(mut self) {
        // Prefetching the leader is a best-effort optimization; failure is
        // non-fatal, the first real message will trigger `update_leader`.
        let _ = self.update_leader().await;

        while let Ok(msg) = self.input.recv_async().await {
            self.handle(msg).await;
        }

        if let Some(output) = self.output.take() {
            self.registry.unref_broker_producer(self.current_broker_id(), output);
        }
        tracing::debug!(topic = %self.topic, partition = self.partition, "partition producer input closed");
    }

    fn current_broker_id(&self) -> crate::collaborators::BrokerId {
        self.leader.as_ref().map(|b| b.id()).unwrap_or_default()
    }

    async fn handle(&mut self, mut msg: ProducerMessage) {
        let r = msg.retries;
        let hwm = self.high_watermark;

        if r > hwm {
            self.new_high_watermark(r).await;
            tokio::time::sleep(self.config.retry.backoff).await;
            self.forward_or_defer(msg).await;
            return;
        }

        if hwm > 0 && r < hwm {
            if msg.is_chaser() {
                self.retry_state[r as usize].expect_chaser = false;
                msg.dispose_in_flight();
            } else {
                self.retry_state[r as usize].buf.push(msg);
            }
            return;
        }

        if hwm > 0 && r == hwm && msg.is_chaser() {
            self.retry_state[hwm as usize].expect_chaser = false;
            self.flush_retry_buffers().await;
            msg.dispose_in_flight();
            return;
        }

        self.forward_or_defer(msg).await;
    }

    async fn forward_or_defer(&mut self, msg: ProducerMessage) {
        if self.output.is_none() && self.update_leader().await.is_err() {
            self.return_with_update_leader_error(msg).await;
            tokio::time::sleep(self.config.retry.backoff).await;
            return;
        }

        if let Some(output) = &self.output {
            if output.send_async(msg).await.is_err() {
                tracing::warn!(topic = %self.topic, partition = self.partition, "aggregator input closed, message dropped");
            }
        }
    }

    async fn return_with_update_leader_error(&mut self, msg: ProducerMessage) {
        self.returns
            .error(
                msg,
                ProduceError::Metadata(MetadataError::Refresh {
                    topic: self.topic.clone(),
                    reason: "no leader available".to_string(),
                }),
            )
            .await;
    }

    /// spec.md §4.3 `newHighWatermark`.
    async fn new_high_watermark(&mut self, h: u16) {
        self.high_watermark = h;
        self.retry_state[h as usize].expect_chaser = true;

        let chaser = ProducerMessage::chaser(self.topic.clone(), self.partition, h, self.in_flight.acquire());

        if let Some(output) = &self.output {
            if output.send_async(chaser).await.is_err() {
                tracing::warn!(topic = %self.topic, partition = self.partition, "aggregator input closed while emitting chaser");
            }
        } else {
            // No broker producer held yet; the chaser has nowhere to go, so
            // dispose its guard immediately rather than leaking it.
            drop(chaser);
        }

        if let Some(output) = self.output.take() {
            self.registry.unref_broker_producer(self.current_broker_id(), output);
        }
    }

    /// spec.md §4.3 `flushRetryBuffers`.
    async fn flush_retry_buffers(&mut self) {
        loop {
            self.high_watermark -= 1;
            let level = self.high_watermark;

            if self.output.is_none() && self.update_leader().await.is_err() {
                let buffered = std::mem::take(&mut self.retry_state[level as usize].buf);
                for msg in buffered {
                    self.return_with_update_leader_error(msg).await;
                }
                return;
            }

            let buffered = std::mem::take(&mut self.retry_state[level as usize].buf);
            if let Some(output) = &self.output {
                for msg in buffered {
                    if output.send_async(msg).await.is_err() {
                        tracing::warn!(topic = %self.topic, partition = self.partition, "aggregator input closed while flushing retry buffer");
                    }
                }
            }

            if self.retry_state[level as usize].expect_chaser {
                return;
            }
            if self.high_watermark == 0 {
                return;
            }
        }
    }

    /// spec.md §4.3 `updateLeader`.
    async fn update_leader(&mut self) -> Result<(), ()> {
        if !self.circuit_breaker.allow() {
            return Err(());
        }

        if self.metadata.refresh_metadata(&self.topic).await.is_err() {
            self.circuit_breaker.record_failure();
            return Err(());
        }

        let leader = match self.metadata.leader(&self.topic, self.partition).await {
            Ok(leader) => leader,
            Err(_) => {
                self.circuit_breaker.record_failure();
                return Err(());
            }
        };

        let output = self.registry.get_broker_producer(leader.clone());
        self.leader = Some(leader);
        self.output = Some(output);
        self.circuit_breaker.record_success();
        Ok(())
    }
}
