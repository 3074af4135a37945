#![forbid(unsafe_code)]
//! Asynchronous ONC RPC over TCP client transport for Rust.
//!
//! This crate turns a TCP byte stream into a concurrent request/response
//! channel for ONC RPC, the transport NFS and its side protocols (MOUNT, NLM,
//! portmap) run on. It does not know about individual procedures: a procedure
//! layer builds a message, hands it to [`Registry::call`] and decodes what
//! comes back.
//!
//! # Overview
//!
//! - [`Registry`] keeps at most one live [`Connection`] per
//!   (host, port, privileged) [`Target`] and creates connections on demand.
//! - [`Connection`] owns one socket, matches replies to calls by XID and
//!   enforces the write-queue high-water mark.
//! - [`marshal`] splits outbound messages into record-marking fragments;
//!   [`codec`] reassembles inbound fragments however the socket chunks them.
//! - [`xdr`] and [`rpc`] provide the message buffer and RPC headers.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use nfsrpc::{Registry, TransportConfig, rpc::{CallHeader, ReplyHeader, XidGenerator}, xdr::XdrReader};
//!
//! #[tokio::main]
//! async fn main() -> nfsrpc::Result<()> {
//!     let registry = Registry::new(TransportConfig::default());
//!     let xids = XidGenerator::new();
//!
//!     // NFSv3 NULL procedure
//!     let call = CallHeader::new(xids.next_xid(), 100003, 3, 0).encode();
//!     let reply = registry
//!         .call("nfs.example.com", 2049, false, call, Duration::from_secs(5))
//!         .await?;
//!
//!     ReplyHeader::decode(&mut XdrReader::new(reply))?.into_result()?;
//!     registry.shutdown_all();
//!     Ok(())
//! }
//! ```
//!
//! # Wire format
//!
//! Every message is sent as one or more fragments. A fragment starts with a
//! big-endian 32-bit word: the top bit marks the last fragment of a message,
//! the remaining 31 bits give the fragment length. The message is the
//! concatenation of the fragment bodies.
//!
//! # Error Handling
//!
//! A call either returns the reply or exactly one [`Error`]. Network trouble
//! of any sort (connect failure, closed connection, full write queue, timeout)
//! is [`ErrorKind::Network`]; failing to bind a privileged source port is
//! [`ErrorKind::LocalBinding`]. The transport never retries.
//!
//! # Logging
//!
//! Everything goes through the `log` facade. Connection lifecycle is logged at
//! `info`/`debug`, individual calls at `trace`.
#[macro_use]
pub mod utils;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
mod handler;
pub mod marshal;
pub mod registry;
pub mod rpc;
pub mod xdr;

pub use crate::config::TransportConfig;
pub use crate::connection::{Connection, ConnectionState, Target};
pub use crate::error::{Error, ErrorKind, NetworkCause};
pub use crate::registry::{Registry, RpcTransport};
pub use crate::utils::Result;
pub use crate::xdr::{XdrBuffer, XdrReader};
