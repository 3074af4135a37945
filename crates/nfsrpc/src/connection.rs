//! One TCP connection to one RPC endpoint.
//!
//! # Lifecycle
//! `Disconnected → Connecting → Connected → Disconnected`. A connection is
//! connected at most once; after it closes it is removed from its registry and
//! never reused, so the next call to the same endpoint gets a fresh one.
//!
//! # Correlation
//! Each in-flight call owns a one-shot channel registered under its XID. The
//! reader task completes the channel when a reply with that XID arrives;
//! replies with no registered XID are dropped. Closing the connection drops
//! every registered channel, which wakes all waiting callers at once.

use {
    crate::{
        config::TransportConfig,
        error::{Error, NetworkCause},
        handler, io_err,
        marshal::{self, Marshalled},
        registry::ConnectionMap,
        utils::Result,
        xdr::XdrBuffer,
    },
    bytes::Bytes,
    dashmap::{DashMap, mapref::entry::Entry},
    log::{debug, info, trace, warn},
    std::{
        fmt, io,
        net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
        ops::RangeInclusive,
        sync::{
            Arc, Mutex, OnceLock, PoisonError, Weak,
            atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering},
        },
        time::Duration,
    },
    tokio::{
        net::{TcpSocket, lookup_host},
        sync::{mpsc, oneshot, watch},
        task::JoinHandle,
        time,
    },
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection goes, and how it binds its local end.
///
/// Privileged and unprivileged connections to the same host and port are
/// different targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub privileged: bool,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, privileged: bool) -> Target {
        Target {
            host: host.into(),
            port,
            privileged,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        if self.privileged {
            write!(f, " (privileged)")?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why the connect attempt failed, kept for callers that were waiting on it.
#[derive(Clone, Debug)]
enum ConnectFailure {
    Io(io::ErrorKind, String),
    Bind {
        first: u16,
        last: u16,
        last_error: Option<(io::ErrorKind, String)>,
    },
}

impl ConnectFailure {
    fn from_error(e: &Error) -> ConnectFailure {
        match e {
            Error::LocalBinding {
                first,
                last,
                last_error,
                ..
            } => ConnectFailure::Bind {
                first: *first,
                last: *last,
                last_error: last_error.as_ref().map(|e| (e.kind(), e.to_string())),
            },
            Error::Network {
                cause: NetworkCause::ConnectFailed(e),
                ..
            } => ConnectFailure::Io(e.kind(), e.to_string()),
            other => ConnectFailure::Io(io::ErrorKind::Other, other.to_string()),
        }
    }
}

struct Pending {
    call_id: u64,
    reply: oneshot::Sender<Bytes>,
}

/// Removes a call's pending entry however the call ends, including when the
/// calling future is dropped.
struct PendingGuard<'a> {
    conn: &'a Connection,
    xid: u32,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn
            .pending
            .remove_if(&self.xid, |_, pending| pending.call_id == self.call_id);
    }
}

pub struct Connection {
    id: u64,
    target: Target,
    config: Arc<TransportConfig>,
    registry: Weak<ConnectionMap>,

    state: watch::Sender<ConnectionState>,
    started: AtomicBool,
    closed: AtomicBool,
    connect_failure: Mutex<Option<ConnectFailure>>,
    local_port: AtomicU16,

    pending: DashMap<u32, Pending>,
    next_call_id: AtomicU64,

    writer: OnceLock<mpsc::UnboundedSender<Marshalled>>,
    queued_bytes: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .field("queued_bytes", &self.queued_bytes())
            .finish()
    }
}

impl Connection {
    /// A connection that belongs to no registry.
    pub fn new(target: Target, config: Arc<TransportConfig>) -> Arc<Connection> {
        Connection::attached(target, config, Weak::new())
    }

    pub(crate) fn attached(
        target: Target,
        config: Arc<TransportConfig>,
        registry: Weak<ConnectionMap>,
    ) -> Arc<Connection> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            target,
            config,
            registry,
            state,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connect_failure: Mutex::new(None),
            local_port: AtomicU16::new(0),
            pending: DashMap::new(),
            next_call_id: AtomicU64::new(0),
            writer: OnceLock::new(),
            queued_bytes: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Bytes handed to the writer and not yet flushed to the socket.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Local port of the socket, once connected.
    pub fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start connecting.
    ///
    /// Resolves the host and, for privileged targets, binds a reserved local
    /// port before returning; the handshake itself runs in the background.
    /// Only the first call does anything.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) || self.is_closed() {
            return Ok(());
        }
        self.state.send_replace(ConnectionState::Connecting);
        if self.is_closed() {
            // lost a race with close(); waiters must not see Connecting
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(Error::network(&self.target, NetworkCause::ConnectionBroken));
        }
        debug!("{}: connecting", self.target);

        let addr = match self.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                self.connect_failed(&e);
                return Err(Error::network(&self.target, NetworkCause::Resolve(e)));
            }
        };

        let socket = match self.open_socket(addr) {
            Ok(socket) => socket,
            Err(e) => {
                self.record_failure(ConnectFailure::from_error(&e));
                self.close();
                return Err(e);
            }
        };

        let handle = tokio::spawn(handler::establish(self.clone(), socket, addr));
        self.track(handle);
        Ok(())
    }

    async fn resolve(&self) -> io::Result<SocketAddr> {
        lookup_host((self.target.host.as_str(), self.target.port))
            .await?
            .next()
            .ok_or_else(|| io_err!(NotFound, format!("{} has no addresses", self.target.host)))
    }

    fn open_socket(&self, addr: SocketAddr) -> Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| Error::network(&self.target, NetworkCause::ConnectFailed(e)))?;

        if self.target.privileged {
            if !nix::unistd::geteuid().is_root() {
                warn!(
                    "{}: binding a privileged port without root privileges will likely fail",
                    self.target
                );
            }
            let unspecified = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            bind_privileged(&self.target, self.config.privileged_ports.clone(), |port| {
                socket.bind(SocketAddr::new(unspecified, port))
            })?;
        }

        Ok(socket)
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            handle.abort();
        } else {
            tasks.push(handle);
        }
    }

    fn record_failure(&self, failure: ConnectFailure) {
        self.connect_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(failure);
    }

    /// The handshake failed; release everyone waiting on it.
    pub(crate) fn connect_failed(&self, e: &io::Error) {
        warn!("{}: connect failed: {}", self.target, e);
        self.record_failure(ConnectFailure::Io(e.kind(), e.to_string()));
        self.close();
    }

    /// The handshake succeeded. Returns false when the connection was closed
    /// in the meantime.
    pub(crate) fn connected(
        &self,
        writer: mpsc::UnboundedSender<Marshalled>,
        local: Option<SocketAddr>,
    ) -> bool {
        if self.writer.set(writer).is_err() || self.is_closed() {
            return false;
        }
        if let Some(local) = local {
            self.local_port.store(local.port(), Ordering::Release);
        }
        self.state.send_replace(ConnectionState::Connected);
        if self.is_closed() {
            self.state.send_replace(ConnectionState::Disconnected);
            return false;
        }
        info!(
            "{}: connected from local port {}",
            self.target,
            self.local_port().unwrap_or(0)
        );
        true
    }

    fn connect_error(&self) -> Error {
        let failure = self
            .connect_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let cause = match failure {
            Some(ConnectFailure::Bind {
                first,
                last,
                last_error,
            }) => {
                return Error::LocalBinding {
                    endpoint: self.target.to_string(),
                    first,
                    last,
                    last_error: last_error.map(|(kind, message)| io::Error::new(kind, message)),
                };
            }
            Some(ConnectFailure::Io(io::ErrorKind::TimedOut, _)) => {
                NetworkCause::ConnectTimeout(self.config.connect_timeout)
            }
            Some(ConnectFailure::Io(kind, message)) => {
                NetworkCause::ConnectFailed(io::Error::new(kind, message))
            }
            None => NetworkCause::ConnectionBroken,
        };
        Error::network(&self.target, cause)
    }

    async fn wait_connected(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::network(&self.target, NetworkCause::ConnectionBroken));
        }
        let mut state = self.state.subscribe();
        let limit = self.config.connect_timeout;
        let resolved = time::timeout(limit, async {
            state
                .wait_for(|s| *s == ConnectionState::Connected || self.is_closed())
                .await
                .map(|s| *s)
        })
        .await;

        match resolved {
            Ok(Ok(ConnectionState::Connected)) if !self.is_closed() => Ok(()),
            Ok(_) => Err(self.connect_error()),
            Err(_) => Err(Error::network(
                &self.target,
                NetworkCause::ConnectTimeout(limit),
            )),
        }
    }

    /// Send `message` and wait up to `timeout` for the reply with the same
    /// XID.
    ///
    /// Never retries. A timed out call leaves nothing behind; its reply, if it
    /// ever shows up, is dropped as unmatched.
    pub async fn call(&self, message: XdrBuffer, timeout: Duration) -> Result<Bytes> {
        if self.state() != ConnectionState::Connected {
            self.wait_connected().await?;
        }

        if self.is_closed() {
            return Err(Error::network(&self.target, NetworkCause::ConnectionBroken));
        }
        let queued = self.queued_bytes();
        let limit = self.config.max_write_queue_bytes;
        if queued >= limit {
            debug!(
                "{}: refusing call, {} bytes already queued",
                self.target, queued
            );
            return Err(Error::network(
                &self.target,
                NetworkCause::QueueFull { queued, limit },
            ));
        }

        let message = marshal::marshal(message, self.config.max_fragment_size)?;
        let xid = message.xid();

        let (tx, rx) = oneshot::channel();
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(xid) {
            Entry::Occupied(_) => {
                return Err(Error::network(&self.target, NetworkCause::XidInFlight(xid)));
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending { call_id, reply: tx });
            }
        }
        let _guard = PendingGuard {
            conn: self,
            xid,
            call_id,
        };
        // close() may have drained the table just before we registered
        if self.is_closed() {
            return Err(Error::network(&self.target, NetworkCause::Closed));
        }

        trace!(
            "{}: xid {:#010x} sending {} bytes in {} fragments",
            self.target,
            xid,
            message.wire_len(),
            message.fragments()
        );
        self.enqueue(message)?;

        match time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::network(&self.target, NetworkCause::Closed)),
            Err(_) => {
                debug!("{}: xid {:#010x} timed out", self.target, xid);
                Err(Error::network(&self.target, NetworkCause::Timeout(timeout)))
            }
        }
    }

    fn enqueue(&self, message: Marshalled) -> Result<()> {
        let broken = || Error::network(&self.target, NetworkCause::ConnectionBroken);
        let writer = self.writer.get().ok_or_else(broken)?;

        let len = message.wire_len();
        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        if writer.send(message).is_err() {
            self.release_queued(len);
            return Err(broken());
        }
        Ok(())
    }

    pub(crate) fn release_queued(&self, len: usize) {
        self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
    }

    /// Hand a reply to the call waiting on `xid`, if there is one.
    pub(crate) fn complete(&self, xid: u32, reply: Bytes) {
        match self.pending.remove(&xid) {
            Some((_, pending)) => {
                if pending.reply.send(reply).is_err() {
                    debug!("{}: caller for xid {:#010x} went away", self.target, xid);
                }
            }
            None => debug!(
                "{}: dropping reply for unknown xid {:#010x}",
                self.target, xid
            ),
        }
    }

    /// Close the connection and fail every pending call.
    ///
    /// Idempotent. Also removes the connection from its registry, unless a
    /// newer connection has already taken its place there.
    pub fn close(&self) {
        // closed before the state change, so woken waiters see both
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Disconnected);
        if already_closed {
            return;
        }
        info!(
            "{}: closing connection, failing {} pending calls",
            self.target,
            self.pending.len()
        );

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        // dropping the senders wakes every waiting caller
        self.pending.clear();

        if let Some(registry) = self.registry.upgrade() {
            if registry
                .remove_if(&self.target, |_, conn| conn.id == self.id)
                .is_some()
            {
                debug!("{}: dropped from registry", self.target);
            }
        }
    }
}

/// Bind a reserved source port, trying the highest port of `ports` first.
///
/// Failed attempts are expected while scanning and only traced.
pub(crate) fn bind_privileged<F>(target: &Target, ports: RangeInclusive<u16>, mut bind: F) -> Result<u16>
where
    F: FnMut(u16) -> io::Result<()>,
{
    let (first, last) = (*ports.end(), *ports.start());
    let mut last_error = None;

    for port in ports.rev() {
        match bind(port) {
            Ok(()) => {
                debug!("{}: bound local port {}", target, port);
                return Ok(port);
            }
            Err(e) => {
                trace!("{}: local port {} unavailable: {}", target, port, e);
                last_error = Some(e);
            }
        }
    }

    warn!(
        "{}: no local port in {}..={} could be bound",
        target, last, first
    );
    Err(Error::LocalBinding {
        endpoint: target.to_string(),
        first,
        last,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new("127.0.0.1", 2049, true)
    }

    #[test]
    fn target_display() {
        assert_eq!(target().to_string(), "127.0.0.1:2049 (privileged)");
        assert_eq!(Target::new("::1", 111, false).to_string(), "[::1]:111");
    }

    #[test]
    fn privileged_scan_takes_first_free_port_from_the_top() {
        let mut tried = Vec::new();
        let port = bind_privileged(&target(), 1..=1023, |port| {
            tried.push(port);
            if port > 1000 {
                Err(io_err!(AddrInUse, "in use"))
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(port, 1000);
        assert_eq!(tried.len(), 24);
        assert_eq!(tried[0], 1023);
    }

    #[test]
    fn privileged_scan_exhaustion_is_a_local_binding_error() {
        let mut attempts = 0;
        let err = bind_privileged(&target(), 1..=1023, |_| {
            attempts += 1;
            Err(io_err!(PermissionDenied, "denied"))
        })
        .unwrap_err();

        assert_eq!(attempts, 1023);
        assert!(err.is_local_binding());
        assert!(!err.is_network());
        match err {
            Error::LocalBinding {
                first,
                last,
                last_error,
                ..
            } => {
                assert_eq!((first, last), (1023, 1));
                assert_eq!(
                    last_error.map(|e| e.kind()),
                    Some(io::ErrorKind::PermissionDenied)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn call_before_connect_fails_as_network_error() {
        let conn = Connection::new(
            Target::new("127.0.0.1", 9, false),
            Arc::new(TransportConfig::default()),
        );
        let mut msg = XdrBuffer::new();
        msg.put_u32(1);

        let err = conn
            .call(msg, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let conn = Connection::new(
            Target::new("127.0.0.1", 9, false),
            Arc::new(TransportConfig::default()),
        );
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.is_closed());

        // connecting a closed connection does not revive it
        conn.connect().await.unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn waiters_see_the_bind_failure_as_local_binding() {
        let conn = Connection::new(target(), Arc::new(TransportConfig::default()));
        let bind = bind_privileged(&target(), 700..=701, |_| Err(io_err!(AddrInUse, "in use")))
            .unwrap_err();
        conn.record_failure(ConnectFailure::from_error(&bind));
        conn.close();

        match conn.connect_error() {
            Error::LocalBinding {
                first,
                last,
                last_error,
                ..
            } => {
                assert_eq!((first, last), (701, 700));
                assert_eq!(last_error.map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn waiters_see_connect_timeouts_as_network_errors() {
        let conn = Connection::new(target(), Arc::new(TransportConfig::default()));
        conn.connect_failed(&io_err!(TimedOut, "timed out"));

        let err = conn.connect_error();
        assert!(matches!(
            err.network_cause(),
            Some(NetworkCause::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn unmatched_reply_is_ignored() {
        let conn = Connection::new(target(), Arc::new(TransportConfig::default()));
        conn.complete(7, Bytes::from_static(&[0, 0, 0, 7]));
        assert_eq!(conn.pending_calls(), 0);
    }
}
