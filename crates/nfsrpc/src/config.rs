//! Transport tuning knobs.

use {
    crate::{codec::DEFAULT_MAX_MESSAGE_SIZE, marshal::DEFAULT_MAX_FRAGMENT_SIZE},
    std::{ops::RangeInclusive, time::Duration},
};

/// How long a TCP handshake may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound bytes a connection may have queued before new calls are refused.
///
/// Large enough to hold many in-flight write payloads; small enough that an
/// unresponsive peer cannot grow the queue without bound.
pub const DEFAULT_MAX_WRITE_QUEUE_BYTES: usize = 1 << 30;

/// Highest reserved source port.
pub const PRIVILEGED_PORT_MAX: u16 = 1023;

/// Lowest reserved source port.
pub const PRIVILEGED_PORT_MIN: u16 = 1;

/// Settings shared by every connection of a [`Registry`](crate::Registry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub max_write_queue_bytes: usize,
    pub max_fragment_size: usize,
    pub max_message_size: usize,
    /// Source ports tried, highest first, when a privileged port is requested.
    pub privileged_ports: RangeInclusive<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_write_queue_bytes: DEFAULT_MAX_WRITE_QUEUE_BYTES,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            privileged_ports: PRIVILEGED_PORT_MIN..=PRIVILEGED_PORT_MAX,
        }
    }
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_write_queue_bytes(mut self, bytes: usize) -> Self {
        self.max_write_queue_bytes = bytes;
        self
    }

    pub fn with_max_fragment_size(mut self, bytes: usize) -> Self {
        self.max_fragment_size = bytes;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_privileged_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.privileged_ports = ports;
        self
    }
}
