//! The retry handler (spec.md §4.8): an unbounded buffered relay from the
//! flusher's retry output back to the dispatcher's input, breaking the
//! pipeline cycle flusher -> retry -> dispatcher -> ... -> flusher.
//!
//! Two loops share an internal unbounded FIFO: one pulls from the
//! (backpressured) retry channel and pushes into the FIFO, which never
//! blocks; the other drains the FIFO into the dispatcher's input at
//! whatever pace the dispatcher accepts. Because pushing into the FIFO
//! never awaits, the reader keeps draining the retry channel even while the
//! writer is stuck on a blocked dispatcher — the property spec.md §9's
//! design note requires to avoid deadlocking the cycle.

use crate::message::ProducerMessage;

/// Relays messages from `retry_rx` to `dispatcher_tx` through an unbounded
/// internal buffer.
pub struct RetryHandler {
    retry_rx: flume::Receiver<ProducerMessage>,
    dispatcher_tx: flume::Sender<ProducerMessage>,
}

impl RetryHandler {
    /// Creates a handler relaying `retry_rx` into `dispatcher_tx`.
    pub fn new(retry_rx: flume::Receiver<ProducerMessage>, dispatcher_tx: flume::Sender<ProducerMessage>) -> Self {
        Self { retry_rx, dispatcher_tx }
    }

    /// Runs both halves of the relay until the retry channel closes and the
    /// FIFO has drained.
    pub async fn run(self) {
        let (fifo_tx, fifo_rx) = flume::unbounded::<ProducerMessage>();

        let reader = async move {
            while let Ok(msg) = self.retry_rx.recv_async().await {
                if fifo_tx.send_async(msg).await.is_err() {
                    break;
                }
            }
            tracing::debug!("retry handler: retry channel closed");
        };

        let writer = async move {
            while let Ok(msg) = fifo_rx.recv_async().await {
                if self.dispatcher_tx.send_async(msg).await.is_err() {
                    tracing::warn!("retry handler: dispatcher input closed with messages still buffered");
                    break;
                }
            }
            tracing::debug!("retry handler: fifo drained, exiting");
        };

        tokio::join!(reader, writer);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(topic: &str) -> ProducerMessage {
        ProducerMessage::new(topic)
    }

    #[tokio::test]
    async fn relays_messages_in_order() {
        let (retry_tx, retry_rx) = flume::unbounded();
        let (dispatcher_tx, dispatcher_rx) = flume::unbounded();
        let handler = RetryHandler::new(retry_rx, dispatcher_tx);
        let handle = tokio::spawn(handler.run());

        retry_tx.send_async(msg("a")).await.unwrap();
        retry_tx.send_async(msg("b")).await.unwrap();

        assert_eq!(dispatcher_rx.recv_async().await.unwrap().topic, "a");
        assert_eq!(dispatcher_rx.recv_async().await.unwrap().topic, "b");

        drop(retry_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reader_keeps_draining_while_writer_blocked() {
        let (retry_tx, retry_rx) = flume::unbounded();
        let (dispatcher_tx, dispatcher_rx) = flume::bounded(1);
        let handler = RetryHandler::new(retry_rx, dispatcher_tx);
        let handle = tokio::spawn(handler.run());

        for i in 0..50 {
            retry_tx.send_async(msg(&i.to_string())).await.unwrap();
        }
        drop(retry_tx);

        let mut seen = Vec::new();
        while let Ok(msg) = dispatcher_rx.recv_async().await {
            seen.push(msg.topic);
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(seen[0], "0");
        assert_eq!(seen[49], "49");

        handle.await.unwrap();
    }
}
