//! Configuration recognized by the producer core (spec.md §6).
//!
//! Loading a config from the environment or a file is explicitly out of
//! scope (spec.md §1); this struct is built programmatically by the
//! embedding application, the way `beaubourg::config` validates an
//! already-parsed struct rather than doing the parsing itself.

use std::time::Duration;

use validator::Validate;

use crate::request::RequiredAcks;

/// Compression codec selection (spec.md §6, `Producer.Compression`).
///
/// Wire-level compression itself is out of scope (spec.md §1); only the
/// size-accounting and message-set-wrapping consequences of enabling it are
/// implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression: one message set per partition, framed uncompressed.
    #[default]
    None,
    /// Gzip.
    Gzip,
    /// Snappy.
    Snappy,
    /// LZ4.
    Lz4,
    /// Zstandard.
    Zstd,
}

impl Compression {
    /// Whether this selection enables compressed-set wrapping and the
    /// tighter size accounting that comes with it.
    pub fn is_enabled(self) -> bool {
        self != Compression::None
    }
}

/// Aggregator flush triggers and hard caps (spec.md §6, `Producer.Flush.*`).
#[derive(Debug, Clone, Validate)]
pub struct FlushConfig {
    /// Flush at most this often. `None` disables the time-based trigger.
    pub frequency: Option<Duration>,
    /// Flush once the buffer reaches this many bytes. `0` disables the
    /// byte-based trigger.
    pub bytes: usize,
    /// Flush once the buffer reaches this many messages. `0` disables the
    /// message-count-based trigger.
    pub messages: usize,
    /// Force a flush before accepting a message that would push the buffer
    /// past this many messages. `0` disables the hard cap.
    pub max_messages: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            frequency: None,
            bytes: 0,
            messages: 0,
            max_messages: 0,
        }
    }
}

impl FlushConfig {
    /// True when all three soft triggers are disabled: flush-as-fast-as-
    /// possible mode (spec.md §4.4).
    pub fn is_unbounded(&self) -> bool {
        self.frequency.is_none() && self.bytes == 0 && self.messages == 0
    }
}

/// Retry ceiling and inter-round sleep (spec.md §6, `Producer.Retry.*`).
#[derive(Debug, Clone, Validate)]
pub struct RetryConfig {
    /// Maximum number of retry rounds. A message at `retries > max` never
    /// appears on the retry channel.
    #[validate(range(max = 1000))]
    pub max: u16,
    /// How long a partition producer sleeps after bumping its high
    /// watermark before forwarding messages at the new level.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Whether terminal dispositions are delivered to the user or silently
/// dropped (spec.md §6, `Producer.Return.*`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnConfig {
    /// Populate [`crate::Producer::successes`].
    pub successes: bool,
    /// Populate [`crate::Producer::errors`].
    pub errors: bool,
}

/// The single configuration struct recognized by the producer core.
#[derive(Debug, Clone, Validate)]
pub struct ProducerConfig {
    /// Per-message size cap, also the compressed-set cap.
    #[validate(range(min = 1))]
    pub max_message_bytes: usize,
    /// Compression codec selection.
    pub compression: Compression,
    /// Aggregator triggers and hard caps.
    #[validate(nested)]
    pub flush: FlushConfig,
    /// Retry ceiling and inter-round sleep.
    #[validate(nested)]
    pub retry: RetryConfig,
    /// Request-level acknowledgement requirement.
    pub required_acks: RequiredAcks,
    /// Request-level broker-side timeout.
    pub timeout: Duration,
    /// Whether terminal dispositions are delivered or dropped.
    pub return_config: ReturnConfig,
    /// Capacity of per-topic and per-partition input channels.
    #[validate(range(min = 1))]
    pub channel_buffer_size: usize,
    /// Global upper bound on a single produce request, with a 10 KiB
    /// margin reserved for protocol overhead (spec.md §4.4).
    #[validate(range(min = 1))]
    pub max_request_size: usize,
}

/// Safety margin reserved for protocol overhead when checking the
/// aggregator's would-overflow predicate against `max_request_size`.
pub const REQUEST_SIZE_MARGIN: usize = 10 * 1024;

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1_000_000,
            compression: Compression::None,
            flush: FlushConfig::default(),
            retry: RetryConfig::default(),
            required_acks: RequiredAcks::Leader,
            timeout: Duration::from_secs(10),
            return_config: ReturnConfig::default(),
            channel_buffer_size: 256,
            max_request_size: 100 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_validates() {
        ProducerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_max_message_bytes_is_invalid() {
        let mut config = ProducerConfig::default();
        config.max_message_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unbounded_flush_mode_detected() {
        assert!(FlushConfig::default().is_unbounded());
        let bounded = FlushConfig {
            messages: 10,
            ..FlushConfig::default()
        };
        assert!(!bounded.is_unbounded());
    }
}
