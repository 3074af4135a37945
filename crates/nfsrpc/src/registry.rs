//! Shared directory of live connections.
//!
//! A [`Registry`] is built once and cloned into whatever needs to make calls;
//! clones share the same connections. There is at most one live connection per
//! [`Target`]: lookups create on miss with an atomic insert-if-absent, and a
//! connection removes itself when it closes so the next call starts afresh.

use {
    crate::{
        config::TransportConfig,
        connection::{Connection, Target},
        utils::Result,
        xdr::XdrBuffer,
    },
    async_trait::async_trait,
    bytes::Bytes,
    dashmap::{DashMap, mapref::entry::Entry},
    log::{debug, info},
    std::{sync::Arc, time::Duration},
};

pub(crate) type ConnectionMap = DashMap<Target, Arc<Connection>>;

/// Something that can carry an RPC call to a target and bring back the reply.
///
/// Procedure layers should be written against this trait rather than
/// [`Registry`] directly.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call_target(
        &self,
        target: &Target,
        message: XdrBuffer,
        timeout: Duration,
    ) -> Result<Bytes>;
}

#[derive(Clone, Debug)]
pub struct Registry {
    config: Arc<TransportConfig>,
    connections: Arc<ConnectionMap>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(TransportConfig::default())
    }
}

impl Registry {
    pub fn new(config: TransportConfig) -> Registry {
        Registry {
            config: Arc::new(config),
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Call `host:port`, connecting first if there is no live connection.
    ///
    /// `timeout` bounds the wait for the reply; the connect itself is bounded
    /// by the configured connect timeout.
    pub async fn call(
        &self,
        host: &str,
        port: u16,
        privileged: bool,
        message: XdrBuffer,
        timeout: Duration,
    ) -> Result<Bytes> {
        let target = Target::new(host, port, privileged);
        self.call_target(&target, message, timeout).await
    }

    pub async fn call_target(
        &self,
        target: &Target,
        message: XdrBuffer,
        timeout: Duration,
    ) -> Result<Bytes> {
        let conn = self.get_or_create(target);
        conn.connect().await?;
        conn.call(message, timeout).await
    }

    fn get_or_create(&self, target: &Target) -> Arc<Connection> {
        match self.connections.entry(target.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!("{}: creating connection", target);
                let conn = Connection::attached(
                    target.clone(),
                    self.config.clone(),
                    Arc::downgrade(&self.connections),
                );
                entry.insert(conn.clone());
                conn
            }
        }
    }

    /// The live connection for `target`, if any.
    pub fn connection(&self, target: &Target) -> Option<Arc<Connection>> {
        self.connections.get(target).map(|c| c.value().clone())
    }

    /// Forget the connection for `target` without closing it.
    ///
    /// Closing a connection drops it on its own; this is for callers that
    /// want the next call to open a new connection regardless.
    pub fn drop_connection(&self, target: &Target) -> Option<Arc<Connection>> {
        self.connections.remove(target).map(|(_, conn)| conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection. Calls still waiting fail with a network error.
    pub fn shutdown_all(&self) {
        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();

        info!("shutting down {} connections", connections.len());
        for conn in connections {
            conn.close();
        }
    }
}

#[async_trait]
impl RpcTransport for Registry {
    async fn call_target(
        &self,
        target: &Target,
        message: XdrBuffer,
        timeout: Duration,
    ) -> Result<Bytes> {
        Registry::call_target(self, target, message, timeout).await
    }
}
