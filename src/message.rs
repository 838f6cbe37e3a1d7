//! The user-facing message envelope and the internal framing it carries.

use std::{any::Any, fmt, sync::Arc};

use crate::error::EncodeError;

/// A value that can be lazily turned into bytes for the wire path.
///
/// Mirrors the `Encode()`/`Length()` collaborator contract: the producer
/// never interprets the bytes, it only needs their length for size checks
/// and their encoding for the (out-of-scope) wire path.
pub trait Encoder: Send + Sync {
    /// Encodes the value, producing the bytes that will be sent on the wire.
    fn encode(&self) -> Result<Vec<u8>, EncodeError>;

    /// Returns the length, in bytes, that `encode` will produce. Must be
    /// cheap: callers use it for size checks before encoding.
    fn length(&self) -> usize;
}

impl Encoder for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(self.clone())
    }

    fn length(&self) -> usize {
        self.len()
    }
}

impl Encoder for String {
    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(self.clone().into_bytes())
    }

    fn length(&self) -> usize {
        self.len()
    }
}

/// Framing overhead counted against every message, on top of key and value
/// length, for all size-limit checks (dispatcher admission, aggregator
/// overflow, request building).
pub const MESSAGE_OVERHEAD: usize = 26;

/// Internal flags carried by a message as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageFlags {
    /// An ordinary message submitted by the user.
    None,
    /// A synthetic message used to confirm that a retry level has drained.
    Chaser,
    /// The sentinel that triggers producer shutdown.
    Shutdown,
}

/// A message flowing through the producer pipeline.
///
/// User code constructs one with [`ProducerMessage::new`] and pushes it into
/// [`crate::Producer::input`]. The producer fills in `partition` during
/// routing and `offset` on a successful produce.
pub struct ProducerMessage {
    /// The destination topic. Must be non-empty.
    pub topic: String,
    /// The optional message key.
    pub key: Option<Box<dyn Encoder>>,
    /// The optional message value.
    pub value: Option<Box<dyn Encoder>>,
    /// Opaque data round-tripped to the success/error channel untouched.
    pub metadata: Option<Arc<dyn Any + Send + Sync>>,
    /// The partition this message was routed to. Set by the topic producer.
    pub partition: Option<i32>,
    /// The offset assigned by the broker. Set on success.
    pub offset: Option<i64>,

    pub(crate) retries: u16,
    pub(crate) flags: MessageFlags,
    pub(crate) encoded_key: Option<Vec<u8>>,
    pub(crate) encoded_value: Option<Vec<u8>>,
    pub(crate) in_flight: Option<crate::in_flight::InFlightGuard>,
}

impl fmt::Debug for ProducerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerMessage")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("retries", &self.retries)
            .field("flags", &self.flags)
            .finish()
    }
}

impl ProducerMessage {
    /// Creates a new user message for `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: None,
            metadata: None,
            partition: None,
            offset: None,
            retries: 0,
            flags: MessageFlags::None,
            encoded_key: None,
            encoded_value: None,
            in_flight: None,
        }
    }

    /// Sets the key.
    pub fn with_key(mut self, key: impl Encoder + 'static) -> Self {
        self.key = Some(Box::new(key));
        self
    }

    /// Sets the value.
    pub fn with_value(mut self, value: impl Encoder + 'static) -> Self {
        self.value = Some(Box::new(value));
        self
    }

    /// Attaches opaque metadata that is handed back on the success/error
    /// channel untouched.
    pub fn with_metadata(mut self, metadata: Arc<dyn Any + Send + Sync>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attaches a fresh in-flight guard, admitting this message into the
    /// pipeline's accounting. Called by the dispatcher exactly once per
    /// message, on first admission (`retries == 0`).
    pub(crate) fn admit(&mut self, tracker: &crate::in_flight::InFlight) {
        self.in_flight = Some(tracker.acquire());
    }

    pub(crate) fn is_chaser(&self) -> bool {
        self.flags == MessageFlags::Chaser
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.flags == MessageFlags::Shutdown
    }

    /// Size accounting authoritative for all size-limit checks: 26 bytes of
    /// framing overhead plus key length plus value length.
    pub fn size(&self) -> usize {
        MESSAGE_OVERHEAD + self.key.as_ref().map_or(0, |k| k.length()) + self.value.as_ref().map_or(0, |v| v.length())
    }

    /// Builds the synthetic chaser for retry level `h`: `{topic, partition,
    /// flags = Chaser, retries = h}`. Its `retries` field is a level marker
    /// matched against the partition producer's `high_watermark`, not an
    /// attempt count, carrying no payload.
    pub(crate) fn chaser(topic: String, partition: i32, high_watermark: u16, in_flight: crate::in_flight::InFlightGuard) -> Self {
        Self {
            topic,
            key: None,
            value: None,
            metadata: None,
            partition: Some(partition),
            offset: None,
            retries: high_watermark,
            flags: MessageFlags::Chaser,
            encoded_key: None,
            encoded_value: None,
            in_flight: Some(in_flight),
        }
    }

    pub(crate) fn shutdown_sentinel(in_flight: crate::in_flight::InFlightGuard) -> Self {
        Self {
            topic: String::new(),
            key: None,
            value: None,
            metadata: None,
            partition: None,
            offset: None,
            retries: 0,
            flags: MessageFlags::Shutdown,
            encoded_key: None,
            encoded_value: None,
            in_flight: Some(in_flight),
        }
    }

    /// Takes ownership of the lazily-cached encoded key, if any.
    pub(crate) fn take_encoded_key(&mut self) -> Option<Vec<u8>> {
        self.encoded_key.take()
    }

    /// Takes ownership of the lazily-cached encoded value, if any.
    pub(crate) fn take_encoded_value(&mut self) -> Option<Vec<u8>> {
        self.encoded_value.take()
    }

    /// Encodes and caches the key and value, unless already cached. Encoded
    /// bytes, once cached, are consumed by exactly one send attempt and
    /// cleared before the message re-enters the retry loop or is handed to
    /// the user.
    pub(crate) fn ensure_encoded(&mut self) -> Result<(), EncodeError> {
        if self.encoded_key.is_none() {
            if let Some(key) = &self.key {
                self.encoded_key = Some(key.encode()?);
            }
        }
        if self.encoded_value.is_none() {
            if let Some(value) = &self.value {
                self.encoded_value = Some(value.encode()?);
            }
        }
        Ok(())
    }

    /// Clears the cached encoded key/value. Called before a message that
    /// failed a send attempt re-enters the retry loop, so a later attempt
    /// re-encodes rather than reusing bytes consumed by the failed attempt.
    pub(crate) fn clear_encoded(&mut self) {
        self.encoded_key = None;
        self.encoded_value = None;
    }

    /// Releases the in-flight guard tied to this message's terminal
    /// disposition (success, permanent error, or consumption as a chaser).
    pub(crate) fn dispose_in_flight(&mut self) {
        self.in_flight.take();
    }
}
