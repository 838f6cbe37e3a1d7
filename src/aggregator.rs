//! Per-broker batcher (spec.md §4.4): accumulates messages from every
//! partition producer currently targeting one broker into size/time/count
//! bounded batches, then hands each batch to the flusher.
//!
//! The event loop races three alternatives: a new input message, a timer
//! fire, and (once a batch is ready) a flush. A two-way input/timer race
//! using `futures::future::select`/`pin_mut!` covers the first two; the
//! third is checked up front each iteration rather than folded into the
//! select, since it depends on buffer state rather than on an external
//! event.

use std::{sync::Arc, time::Duration};

use futures::{
    future::{select, Either},
    pin_mut,
};

use crate::{config::ProducerConfig, message::ProducerMessage};

/// One running instance, owning the accumulation buffer for one broker.
pub struct Aggregator {
    input: flume::Receiver<ProducerMessage>,
    output: flume::Sender<Vec<ProducerMessage>>,
    config: Arc<ProducerConfig>,
    buffer: Vec<ProducerMessage>,
    buffer_bytes: usize,
}

impl Aggregator {
    /// Creates an aggregator reading from `input` and emitting full batches
    /// on `output`.
    pub fn new(input: flume::Receiver<ProducerMessage>, output: flume::Sender<Vec<ProducerMessage>>, config: Arc<ProducerConfig>) -> Self {
        Self {
            input,
            output,
            config,
            buffer: Vec::new(),
            buffer_bytes: 0,
        }
    }

    /// Runs the event loop until the upstream channel closes, flushing any
    /// remaining messages and closing `output` on exit.
    pub async fn run(mut self) {
        let mut timer = self.config.flush.frequency.filter(|d| *d > Duration::ZERO).map(tokio::time::interval);

        loop {
            if !self.buffer.is_empty() && self.ready_to_flush() {
                self.flush().await;
                continue;
            }

            let msg = match &mut timer {
                Some(timer) => {
                    let recv_fut = self.input.recv_async();
                    let tick_fut = timer.tick();
                    pin_mut!(recv_fut, tick_fut);
                    match select(recv_fut, tick_fut).await {
                        Either::Left((msg, _)) => Some(msg),
                        Either::Right((_, _)) => None,
                    }
                }
                None => Some(self.input.recv_async().await),
            };

            let msg = match msg {
                Some(msg) => msg,
                None => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                    continue;
                }
            };

            match msg {
                Ok(msg) => self.accept(msg).await,
                Err(_) => break,
            }
        }

        if !self.buffer.is_empty() {
            self.flush().await;
        }
    }

    async fn accept(&mut self, msg: ProducerMessage) {
        if self.would_overflow(&msg) {
            self.flush().await;
        }

        self.buffer_bytes += msg.size();
        self.buffer.push(msg);
    }

    fn ready_to_flush(&self) -> bool {
        let flush = &self.config.flush;

        flush.is_unbounded()
            || self.buffer.last().map(ProducerMessage::is_chaser).unwrap_or(false)
            || (flush.messages > 0 && self.buffer.len() >= flush.messages)
            || (flush.bytes > 0 && self.buffer_bytes >= flush.bytes)
    }

    fn would_overflow(&self, msg: &ProducerMessage) -> bool {
        let flush = &self.config.flush;
        let projected = self.buffer_bytes + msg.size();

        projected + crate::config::REQUEST_SIZE_MARGIN >= self.config.max_request_size
            || (self.config.compression.is_enabled() && projected >= self.config.max_message_bytes)
            || (flush.max_messages > 0 && self.buffer.len() >= flush.max_messages)
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;

        if self.output.send_async(batch).await.is_err() {
            tracing::warn!("flusher input channel closed, dropping batch");
        }
    }
}
