//! Fixed-size pools of pre-built, already-connected instances.
//!
//! A pool is a bounded queue of ready instances: `get` blocks while the pool
//! is empty (exhaustion is backpressure, not an error) and `put` hands an
//! instance back without any health check, because every pooled instance heals
//! itself through its own supervisory loop.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::broker::{AmqpBroker, Broker};
use crate::channel::{Channel, ChannelOptions};
use crate::connection::{Connection, ConnectionOptions};
use crate::errors::{Error, Result};
use crate::unsafe_channel::UnsafeChannel;

/// Storage mechanics shared by the three pool types: a bounded channel whose
/// buffer is the pool.
struct FixedPool<T> {
    slots: mpsc::Sender<T>,
    idle: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T> FixedPool<T> {
    fn new(capacity: usize) -> Self {
        let (slots, idle) = mpsc::channel(capacity.max(1));
        FixedPool {
            slots,
            idle: Mutex::new(idle),
            capacity,
        }
    }

    async fn seed(&self, item: T) {
        // The receiver lives as long as the pool; seeding cannot fail.
        let _ = self.slots.send(item).await;
    }

    async fn get(&self) -> Result<T> {
        let mut idle = self.idle.lock().await;
        idle.recv().await.ok_or(Error::PoolClosed)
    }

    async fn put(&self, item: T) {
        if self.slots.send(item).await.is_err() {
            warn!("pool already closed, dropping returned instance");
        }
    }

    /// Stop the pool and take everything still parked in it.
    async fn drain(&self) -> Vec<T> {
        let mut idle = self.idle.lock().await;
        idle.close();
        let mut items = Vec::new();
        while let Ok(item) = idle.try_recv() {
            items.push(item);
        }
        items
    }
}

/// Fixed-capacity pool of ready [`Connection`]s.
pub struct ConnectionPool {
    pool: FixedPool<Connection>,
}

impl ConnectionPool {
    /// Eagerly dial `size` connections; blocks until all of them are up.
    pub async fn open(addr: &str, size: usize) -> Self {
        Self::open_with(Arc::new(AmqpBroker), addr, size, ConnectionOptions::default()).await
    }

    pub async fn open_with(
        broker: Arc<dyn Broker>,
        addr: &str,
        size: usize,
        options: ConnectionOptions,
    ) -> Self {
        let pool = FixedPool::new(size);
        for _ in 0..size {
            let connection = Connection::open_with(broker.clone(), addr, options.clone()).await;
            pool.seed(connection).await;
        }
        info!(addr, size, "connection pool ready");
        ConnectionPool { pool }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity
    }

    /// Take a connection; blocks while the pool is empty.
    pub async fn get(&self) -> Result<Connection> {
        self.pool.get().await
    }

    /// Return a connection, healthy or not.
    pub async fn put(&self, connection: Connection) {
        self.pool.put(connection).await;
    }

    /// Close every pooled connection, accumulating failures. Instances
    /// currently handed out are their holder's responsibility.
    pub async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        for connection in self.pool.drain().await {
            if let Err(e) = connection.close().await {
                failures.push(e);
            }
        }
        Error::from_failures(failures)
    }
}

/// Fixed-capacity pool of reliable [`Channel`]s, `per_conn` of them on every
/// connection of the underlying pool.
pub struct ChannelPool {
    pool: FixedPool<Channel>,
}

impl ChannelPool {
    pub async fn open(connections: &ConnectionPool, per_conn: usize) -> Result<Self> {
        Self::open_with(connections, per_conn, ChannelOptions::default()).await
    }

    pub async fn open_with(
        connections: &ConnectionPool,
        per_conn: usize,
        options: ChannelOptions,
    ) -> Result<Self> {
        let capacity = connections.capacity() * per_conn;
        let pool = FixedPool::new(capacity);
        for _ in 0..connections.capacity() {
            let connection = connections.get().await?;
            for _ in 0..per_conn {
                let channel = Channel::open_with(&connection, options.clone()).await;
                pool.seed(channel).await;
            }
            connections.put(connection).await;
        }
        info!(capacity, "channel pool ready");
        Ok(ChannelPool { pool })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity
    }

    pub async fn get(&self) -> Result<Channel> {
        self.pool.get().await
    }

    pub async fn put(&self, channel: Channel) {
        self.pool.put(channel).await;
    }

    pub async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        for channel in self.pool.drain().await {
            if let Err(e) = channel.close().await {
                failures.push(e);
            }
        }
        Error::from_failures(failures)
    }
}

/// Fixed-capacity pool of [`UnsafeChannel`]s for loss-tolerant publishing.
pub struct UnsafeChannelPool {
    pool: FixedPool<UnsafeChannel>,
}

impl UnsafeChannelPool {
    pub async fn open(connections: &ConnectionPool, per_conn: usize) -> Result<Self> {
        Self::open_with(connections, per_conn, ChannelOptions::default()).await
    }

    pub async fn open_with(
        connections: &ConnectionPool,
        per_conn: usize,
        options: ChannelOptions,
    ) -> Result<Self> {
        let capacity = connections.capacity() * per_conn;
        let pool = FixedPool::new(capacity);
        for _ in 0..connections.capacity() {
            let connection = connections.get().await?;
            for _ in 0..per_conn {
                let channel = UnsafeChannel::open_with(&connection, options.clone()).await;
                pool.seed(channel).await;
            }
            connections.put(connection).await;
        }
        info!(capacity, "unsafe channel pool ready");
        Ok(UnsafeChannelPool { pool })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity
    }

    pub async fn get(&self) -> Result<UnsafeChannel> {
        self.pool.get().await
    }

    pub async fn put(&self, channel: UnsafeChannel) {
        self.pool.put(channel).await;
    }

    pub async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        for channel in self.pool.drain().await {
            if let Err(e) = channel.close().await {
                failures.push(e);
            }
        }
        Error::from_failures(failures)
    }
}
