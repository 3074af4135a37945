//! Transport error types.
//!
//! Every failed `call()` surfaces exactly one [`Error`]. The two kinds that
//! matter to a calling layer are [`ErrorKind::Network`], covering everything
//! that went wrong between this host and the peer, and
//! [`ErrorKind::LocalBinding`], which means no reserved source port could be
//! bound here. The transport never retries either of them.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect failure, broken connection, full write queue or call timeout.
    Network,
    /// The privileged source port search found no free port.
    LocalBinding,
    /// The outbound message could not be framed.
    Encoding,
    /// A received RPC message could not be parsed.
    Protocol,
    /// Plain I/O outside of a call.
    Io,
}

/// Why a call failed with a network error.
#[derive(Debug, Error)]
pub enum NetworkCause {
    /// The host name did not resolve to any address.
    #[error("address resolution failed: {0}")]
    Resolve(#[source] io::Error),
    /// The TCP handshake failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
    /// The TCP handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// No reply arrived within the call timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The outbound write queue is at its high-water mark.
    #[error("too many pending writes ({queued} bytes queued, limit {limit})")]
    QueueFull { queued: usize, limit: usize },
    /// The connection was already closed when the call was issued.
    #[error("connection is broken")]
    ConnectionBroken,
    /// The connection closed while the call was waiting for its reply.
    #[error("connection closed while waiting for reply")]
    Closed,
    /// Another call with the same XID is still waiting on this connection.
    #[error("xid {0:#010x} is already in flight")]
    XidInFlight(u32),
}

fn last_error_suffix(e: &Option<io::Error>) -> String {
    match e {
        Some(e) => format!(" (last error: {})", e),
        None => String::new(),
    }
}

/// The error type of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A call could not be completed over the network.
    #[error("network error talking to {endpoint}: {cause}")]
    Network {
        endpoint: String,
        #[source]
        cause: NetworkCause,
    },
    /// Every port of the privileged range failed to bind.
    #[error(
        "no local port in {last}..={first} could be bound for {endpoint}{}",
        last_error_suffix(.last_error)
    )]
    LocalBinding {
        endpoint: String,
        first: u16,
        last: u16,
        #[source]
        last_error: Option<io::Error>,
    },
    /// The message could not be split into fragments.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// A reply did not follow the RPC message layout.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// I/O error outside of the call path.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn network(endpoint: impl fmt::Display, cause: NetworkCause) -> Error {
        Error::Network {
            endpoint: endpoint.to_string(),
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::Network { .. } => ErrorKind::Network,
            Error::LocalBinding { .. } => ErrorKind::LocalBinding,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    pub fn is_local_binding(&self) -> bool {
        self.kind() == ErrorKind::LocalBinding
    }

    /// The network cause, if this is a network error.
    pub fn network_cause(&self) -> Option<&NetworkCause> {
        match *self {
            Error::Network { ref cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let net = Error::network("10.0.0.1:2049", NetworkCause::Closed);
        let bind = Error::LocalBinding {
            endpoint: "10.0.0.1:2049 (privileged)".to_owned(),
            first: 1023,
            last: 1,
            last_error: None,
        };

        assert!(net.is_network());
        assert!(!net.is_local_binding());
        assert!(bind.is_local_binding());
        assert!(!bind.is_network());
    }

    #[test]
    fn display_names_endpoint_and_cause() {
        let e = Error::network(
            "server:2049",
            NetworkCause::QueueFull {
                queued: 10,
                limit: 8,
            },
        );
        let text = e.to_string();
        assert!(text.contains("server:2049"));
        assert!(text.contains("too many pending writes"));

        let e = Error::network("server:2049", NetworkCause::Timeout(Duration::from_secs(3)));
        assert!(e.to_string().contains("no reply within 3s"));
    }

    #[test]
    fn local_binding_reports_range_and_last_error() {
        let e = Error::LocalBinding {
            endpoint: "server:2049 (privileged)".to_owned(),
            first: 1023,
            last: 1,
            last_error: Some(io::Error::new(io::ErrorKind::AddrInUse, "in use")),
        };
        assert_eq!(
            e.to_string(),
            "no local port in 1..=1023 could be bound for server:2049 (privileged) (last error: in use)"
        );
        assert!(std::error::Error::source(&e).is_some());
    }
}
