use crate::base::neterror::NetError;
use crate::base::uri::DestinationKey;
use crate::reactor::{Reactor, Watcher};
use crate::socket::client::Socket;
use crate::socket::connectjob::{Connect, ConnectJob, ConnectOptions};
use crate::socket::SocketId;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Checkout/checkin/clear of pooled client sockets.
pub trait SocketPool: Send + Sync {
    /// Returns an idle socket for `uri` or connects a new one.
    ///
    /// Fails with [`NetError::Cancelled`] without doing any work when
    /// `token` is already cancelled.
    fn checkout<'a>(
        &'a self,
        uri: &'a str,
        token: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<Socket, NetError>>;

    /// Returns a checked-out socket to the free list.
    fn checkin(&self, socket: &Socket) -> Result<(), NetError>;

    /// Forgets a socket. Closing it stays the caller's responsibility.
    fn clear(&self, socket: &Socket) -> Result<(), NetError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// How long a checked-in socket may stay idle before it is evicted.
    pub idle_timeout: Duration,
    pub connect: ConnectOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            connect: ConnectOptions::default(),
        }
    }
}

impl PoolOptions {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }
}

/// Pool-private state of one socket.
struct PoolEntry {
    socket: Socket,
    available: bool,
    /// Created on first checkin, re-armed on every later one.
    idle_watcher: Option<Watcher>,
}

/// Per-destination free lists of client sockets.
///
/// Entries for one destination are scanned in socket-id order. Idle
/// sockets are evicted after [`PoolOptions::idle_timeout`]; the eviction
/// timers never keep the reactor alive.
#[derive(Clone)]
pub struct BasicSocketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    reactor: Reactor,
    options: PoolOptions,
    connector: Arc<dyn Connect>,
    buckets: DashMap<DestinationKey, BTreeMap<SocketId, PoolEntry>>,
    socket_index: DashMap<SocketId, DestinationKey>,
    pending: DashMap<DestinationKey, usize>,
}

impl fmt::Debug for BasicSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicSocketPool")
            .field("idle_timeout", &self.inner.options.idle_timeout)
            .field("destinations", &self.inner.buckets.len())
            .field("sockets", &self.socket_count())
            .finish()
    }
}

impl BasicSocketPool {
    pub fn new(reactor: Reactor, options: PoolOptions) -> Self {
        let connector = Arc::new(ConnectJob::new(reactor.clone(), options.connect.clone()));
        Self::with_connector(reactor, options, connector)
    }

    pub fn with_connector(
        reactor: Reactor,
        options: PoolOptions,
        connector: Arc<dyn Connect>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                reactor,
                options,
                connector,
                buckets: DashMap::new(),
                socket_index: DashMap::new(),
                pending: DashMap::new(),
            }),
        }
    }

    /// In-flight connects for `uri`.
    pub fn pending_count(&self, uri: &str) -> usize {
        DestinationKey::parse(uri)
            .ok()
            .and_then(|key| self.inner.pending.get(&key).map(|count| *count))
            .unwrap_or(0)
    }

    /// Checked-in sockets across all destinations.
    pub fn idle_count(&self) -> usize {
        self.inner
            .buckets
            .iter()
            .map(|bucket| bucket.values().filter(|entry| entry.available).count())
            .sum()
    }

    /// Sockets known to the pool, checked out or not.
    pub fn socket_count(&self) -> usize {
        self.inner.socket_index.len()
    }

    async fn checkout_socket(
        &self,
        uri: &str,
        token: Option<&CancellationToken>,
    ) -> Result<Socket, NetError> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(NetError::Cancelled);
        }
        let key = DestinationKey::parse(uri)?;

        if let Some(socket) = self.inner.take_idle(&key) {
            tracing::debug!(destination = %key, socket = socket.id(), "pool checkout hit");
            return Ok(socket);
        }
        tracing::debug!(destination = %key, "pool checkout miss, connecting");

        let socket = {
            let _pending = PendingConnect::new(&self.inner.pending, &key);
            self.inner.connector.connect(&key, token).await?
        };

        self.inner.register(key, socket.clone());
        Ok(socket)
    }
}

impl SocketPool for BasicSocketPool {
    fn checkout<'a>(
        &'a self,
        uri: &'a str,
        token: Option<&'a CancellationToken>,
    ) -> BoxFuture<'a, Result<Socket, NetError>> {
        Box::pin(self.checkout_socket(uri, token))
    }

    fn checkin(&self, socket: &Socket) -> Result<(), NetError> {
        let id = socket.id();
        let key = self
            .inner
            .socket_index
            .get(&id)
            .map(|key| key.value().clone())
            .ok_or(NetError::UnknownSocket(id))?;

        if !socket.is_connected() {
            tracing::debug!(destination = %key, socket = id, "checked in dead socket, clearing");
            self.inner.remove(id);
            return Ok(());
        }

        let mut bucket = self
            .inner
            .buckets
            .get_mut(&key)
            .ok_or(NetError::UnknownSocket(id))?;
        let entry = bucket.get_mut(&id).ok_or(NetError::UnknownSocket(id))?;
        entry.available = true;
        match &entry.idle_watcher {
            Some(watcher) if !watcher.is_cancelled() => watcher.enable(),
            _ => entry.idle_watcher = Some(self.inner.idle_watcher(id)),
        }
        tracing::trace!(destination = %key, socket = id, "socket checked in");
        Ok(())
    }

    fn clear(&self, socket: &Socket) -> Result<(), NetError> {
        let id = socket.id();
        self.inner
            .remove(id)
            .map(|_| tracing::trace!(socket = id, "socket cleared from pool"))
            .ok_or(NetError::UnknownSocket(id))
    }
}

impl PoolInner {
    /// Claims the first available live entry, dropping dead ones on the way.
    fn take_idle(&self, key: &DestinationKey) -> Option<Socket> {
        let mut dead = Vec::new();
        let found = {
            let mut bucket = self.buckets.get_mut(key)?;
            let mut found = None;
            for (id, entry) in bucket.iter_mut() {
                if !entry.available {
                    continue;
                }
                if !entry.socket.is_connected() {
                    dead.push(*id);
                    continue;
                }
                entry.available = false;
                if let Some(watcher) = &entry.idle_watcher {
                    watcher.disable();
                }
                found = Some(entry.socket.clone());
                break;
            }
            found
        };

        for id in dead {
            tracing::debug!(destination = %key, socket = id, "evicting dead pooled socket");
            self.remove(id);
        }
        found
    }

    fn register(&self, key: DestinationKey, socket: Socket) {
        let id = socket.id();
        self.buckets.entry(key.clone()).or_default().insert(
            id,
            PoolEntry {
                socket,
                available: false,
                idle_watcher: None,
            },
        );
        self.socket_index.insert(id, key);
    }

    fn remove(&self, id: SocketId) -> Option<PoolEntry> {
        let (_, key) = self.socket_index.remove(&id)?;
        let entry = match self.buckets.get_mut(&key) {
            Some(mut bucket) => bucket.remove(&id),
            None => None,
        };
        self.buckets.remove_if(&key, |_, bucket| bucket.is_empty());

        if let Some(watcher) = entry.as_ref().and_then(|e| e.idle_watcher.as_ref()) {
            watcher.cancel();
        }
        entry
    }

    fn idle_watcher(self: &Arc<Self>, id: SocketId) -> Watcher {
        let pool: Weak<PoolInner> = Arc::downgrade(self);
        let watcher = self.reactor.delay(self.options.idle_timeout, move || {
            if let Some(pool) = pool.upgrade() {
                pool.evict_idle(id);
            }
        });
        watcher.unreference();
        watcher
    }

    /// Removes the entry only if it is still sitting in the free list.
    fn evict_idle(&self, id: SocketId) {
        let Some(key) = self.socket_index.get(&id).map(|key| key.value().clone()) else {
            return;
        };
        let evicted = {
            let Some(mut bucket) = self.buckets.get_mut(&key) else {
                return;
            };
            match bucket.get(&id) {
                Some(entry) if entry.available => bucket.remove(&id),
                _ => None,
            }
        };
        if evicted.is_some() {
            self.socket_index.remove(&id);
            self.buckets.remove_if(&key, |_, bucket| bucket.is_empty());
            tracing::debug!(destination = %key, socket = id, "idle socket evicted");
        }
    }
}

/// Counts one in-flight connect for a destination while alive.
struct PendingConnect<'a> {
    pending: &'a DashMap<DestinationKey, usize>,
    key: DestinationKey,
}

impl<'a> PendingConnect<'a> {
    fn new(pending: &'a DashMap<DestinationKey, usize>, key: &DestinationKey) -> Self {
        *pending.entry(key.clone()).or_insert(0) += 1;
        Self {
            pending,
            key: key.clone(),
        }
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.pending.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.pending.remove_if(&self.key, |_, count| *count == 0);
    }
}

/// A pool bound to one destination.
#[derive(Clone)]
pub struct StaticSocketPool {
    uri: String,
    pool: Arc<dyn SocketPool>,
}

impl fmt::Debug for StaticSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSocketPool")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl StaticSocketPool {
    pub fn new(uri: impl Into<String>, pool: Arc<dyn SocketPool>) -> Self {
        Self {
            uri: uri.into(),
            pool,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn checkout(&self, token: Option<&CancellationToken>) -> Result<Socket, NetError> {
        self.pool.checkout(&self.uri, token).await
    }

    pub fn checkin(&self, socket: &Socket) -> Result<(), NetError> {
        self.pool.checkin(socket)
    }

    pub fn clear(&self, socket: &Socket) -> Result<(), NetError> {
        self.pool.clear(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_defaults() {
        let opts: PoolOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.idle_timeout, Duration::from_secs(10));
        assert_eq!(opts.connect, ConnectOptions::default());
    }

    #[test]
    fn test_pending_connect_guard() {
        let pending = DashMap::new();
        let key = DestinationKey::parse("tcp://example.com:80").unwrap();

        let first = PendingConnect::new(&pending, &key);
        let second = PendingConnect::new(&pending, &key);
        assert_eq!(*pending.get(&key).unwrap(), 2);

        drop(first);
        assert_eq!(*pending.get(&key).unwrap(), 1);
        drop(second);
        assert!(pending.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_invalid_uri_faults() {
        let pool = BasicSocketPool::new(Reactor::new(), PoolOptions::default());
        let err = pool.checkout("http://example.com", None).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidUriScheme(_)));
        assert_eq!(pool.pending_count("http://example.com"), 0);
    }
}
