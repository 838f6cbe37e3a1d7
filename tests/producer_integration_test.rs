//! End-to-end scenarios driving a real [`Producer`] against the mock
//! collaborators in `support`, mirroring spec.md §8's scenario table.

mod support;

use std::time::Duration;

use commitlog_producer::{Encoder, Producer, ProducerConfig, ProducerMessage, ResponseError};
use support::{FixedPartitioner, MockBroker, MockMetadata, Outcome};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn fast_retry_config() -> ProducerConfig {
    let mut config = ProducerConfig::default();
    config.retry.backoff = Duration::from_millis(1);
    config.return_config.successes = true;
    config.return_config.errors = true;
    config
}

async fn recv_success(producer: &Producer) -> ProducerMessage {
    timeout(RECV_TIMEOUT, producer.successes().recv_async())
        .await
        .expect("timed out waiting for a success")
        .expect("successes channel closed unexpectedly")
}

/// S1: a message produced against a broker that always succeeds is
/// delivered on `successes()` with an assigned offset.
#[tokio::test]
async fn happy_path_delivers_success_with_offset() {
    let broker = MockBroker::always(1, Outcome::Success);
    let metadata = MockMetadata::single_partition("orders", broker);
    let producer = Producer::new(fast_retry_config(), metadata, std::sync::Arc::new(FixedPartitioner(0)));

    producer
        .input()
        .send_async(ProducerMessage::new("orders").with_value(b"payload".to_vec()))
        .await
        .unwrap();

    let delivered = recv_success(&producer).await;
    assert_eq!(delivered.topic, "orders");
    assert_eq!(delivered.partition, Some(0));
    assert_eq!(delivered.offset, Some(0));

    producer.close().await.unwrap();
}

/// S2: a message that the broker first rejects with a retriable error is
/// eventually delivered, and a message submitted for the same partition
/// afterward is not delivered out of order ahead of it.
#[tokio::test]
async fn retried_message_is_delivered_before_later_message() {
    let broker = MockBroker::new(1, vec![Outcome::Retriable(ResponseError::NotLeaderForPartition), Outcome::Success]);
    let metadata = MockMetadata::single_partition("orders", broker);
    let producer = Producer::new(fast_retry_config(), metadata, std::sync::Arc::new(FixedPartitioner(0)));

    producer
        .input()
        .send_async(ProducerMessage::new("orders").with_value(b"first".to_vec()))
        .await
        .unwrap();

    // Give the first message time to fail once and re-enter the retry
    // cycle before the second message is admitted.
    tokio::time::sleep(Duration::from_millis(50)).await;

    producer
        .input()
        .send_async(ProducerMessage::new("orders").with_value(b"second".to_vec()))
        .await
        .unwrap();

    let first = recv_success(&producer).await;
    let second = recv_success(&producer).await;

    assert_eq!(first.value.as_ref().unwrap().length(), b"first".len());
    assert_eq!(second.value.as_ref().unwrap().length(), b"second".len());

    producer.close().await.unwrap();
}

/// S3: a message larger than `max_message_bytes` is rejected by the
/// dispatcher before it ever reaches a partition, with no broker call made.
#[tokio::test]
async fn oversized_message_is_rejected_without_a_broker_call() {
    let broker = MockBroker::always(1, Outcome::Success);
    let metadata = MockMetadata::single_partition("orders", broker.clone());
    let mut config = fast_retry_config();
    config.max_message_bytes = 16;
    let producer = Producer::new(config, metadata, std::sync::Arc::new(FixedPartitioner(0)));

    producer
        .input()
        .send_async(ProducerMessage::new("orders").with_value(vec![0u8; 1024]))
        .await
        .unwrap();

    let failed = timeout(RECV_TIMEOUT, producer.errors().recv_async())
        .await
        .expect("timed out waiting for an error")
        .expect("errors channel closed unexpectedly");

    assert!(matches!(failed.err, commitlog_producer::ProduceError::MessageSizeTooLarge));
    assert_eq!(broker.produce_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    producer.close().await.unwrap();
}

/// S4: a message that keeps failing with a retriable error exhausts
/// `Retry.Max` and is returned as a permanent error, not retried forever.
#[tokio::test]
async fn retries_exhausted_surfaces_a_permanent_error() {
    let broker = MockBroker::always(1, Outcome::Retriable(ResponseError::LeaderNotAvailable));
    let metadata = MockMetadata::single_partition("orders", broker);
    let mut config = fast_retry_config();
    config.retry.max = 2;
    let producer = Producer::new(config, metadata, std::sync::Arc::new(FixedPartitioner(0)));

    producer
        .input()
        .send_async(ProducerMessage::new("orders").with_value(b"doomed".to_vec()))
        .await
        .unwrap();

    let failed = timeout(RECV_TIMEOUT, producer.errors().recv_async())
        .await
        .expect("timed out waiting for a retries-exhausted error")
        .expect("errors channel closed unexpectedly");

    match failed.err {
        commitlog_producer::ProduceError::RetriesExhausted { attempts } => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    producer.close().await.unwrap();
}

/// S6: a transport-level failure abandons the broker connection and
/// retries every in-flight message rather than delivering it as a success
/// or dropping it.
#[tokio::test]
async fn transport_failure_abandons_connection_and_retries() {
    let broker = MockBroker::new(1, vec![Outcome::Transport, Outcome::Success]);
    let metadata = MockMetadata::single_partition("orders", broker.clone());
    let producer = Producer::new(fast_retry_config(), metadata, std::sync::Arc::new(FixedPartitioner(0)));

    producer
        .input()
        .send_async(ProducerMessage::new("orders").with_value(b"payload".to_vec()))
        .await
        .unwrap();

    let delivered = recv_success(&producer).await;
    assert_eq!(delivered.offset, Some(0));
    assert!(broker.closed.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    producer.close().await.unwrap();
}
