//! A broker connection that keeps itself alive.
//!
//! One background task per connection owns the live handle: it dials, waits
//! for the connection to drop, and dials again at a fixed interval until the
//! connection is deliberately closed.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{AmqpBroker, Broker, BrokerConnection};
use crate::errors::{Error, Result};

/// Delay between redial attempts. Fixed: no backoff, no attempt cap.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub reconnect_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// A self-healing connection to the broker.
///
/// Cloning is cheap and yields another handle onto the same underlying
/// connection; the last thing a connection's owner does is call [`close`].
///
/// [`close`]: Connection::close
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: String,
    addr: String,
    reconnect_delay: Duration,
    broker: Arc<dyn Broker>,
    handle: RwLock<Option<Arc<dyn BrokerConnection>>>,
    ready: watch::Sender<bool>,
    done: CancellationToken,
}

impl Connection {
    /// Connect to `addr`, blocking until the first dial succeeds.
    ///
    /// Dial failures are retried forever at the configured interval, so this
    /// only returns once the broker was reachable at least once. Callers that
    /// cannot wait indefinitely should wrap the call in a timeout.
    pub async fn open(addr: &str) -> Self {
        Self::open_with(Arc::new(AmqpBroker), addr, ConnectionOptions::default()).await
    }

    /// Same as [`open`](Connection::open), with an explicit broker
    /// implementation and tuning.
    pub async fn open_with(broker: Arc<dyn Broker>, addr: &str, options: ConnectionOptions) -> Self {
        let (ready, _) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            id: format!("conn-{}", &Uuid::new_v4().to_string()[..8]),
            addr: addr.to_string(),
            reconnect_delay: options.reconnect_delay,
            broker,
            handle: RwLock::new(None),
            ready,
            done: CancellationToken::new(),
        });
        tokio::spawn(supervise(inner.clone()));

        let connection = Connection { inner };
        connection.wait_ready().await;
        connection
    }

    /// Block until the connection reports ready. Wakes on the next readiness
    /// epoch if currently disconnected, immediately otherwise.
    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives inside `inner`, so this cannot error while a
        // handle exists.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// The current live broker connection, if any. Do not cache the handle
    /// across a reconnect; take it again per use.
    pub fn underlying(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.inner
            .handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    /// Shut the connection down for good.
    ///
    /// Errors with [`Error::AlreadyClosed`] when the connection is not
    /// currently ready; exactly one close can succeed per instance.
    pub async fn close(&self) -> Result<()> {
        let was_ready = self.inner.ready.send_replace(false);
        if !was_ready {
            return Err(Error::AlreadyClosed);
        }

        self.inner.done.cancel();
        let handle = self
            .inner
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = handle {
            connection.close().await?;
        }
        info!(id = %self.inner.id, "connection closed");
        Ok(())
    }
}

async fn supervise(inner: Arc<ConnectionInner>) {
    loop {
        inner.ready.send_replace(false);
        *inner
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        debug!(id = %inner.id, addr = %inner.addr, "dialing broker");
        let dialed = tokio::select! {
            _ = inner.done.cancelled() => break,
            dialed = inner.broker.dial(&inner.addr) => dialed,
        };
        let connection = match dialed {
            Ok(connection) => connection,
            Err(e) => {
                warn!(id = %inner.id, addr = %inner.addr, error = %e, "dial failed, retrying");
                tokio::select! {
                    _ = inner.done.cancelled() => break,
                    _ = sleep(inner.reconnect_delay) => continue,
                }
            }
        };

        *inner
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection.clone());
        inner.ready.send_replace(true);
        info!(id = %inner.id, addr = %inner.addr, "connected to broker");

        tokio::select! {
            _ = inner.done.cancelled() => break,
            _ = connection.closed() => {
                warn!(id = %inner.id, "connection lost, reconnecting");
            }
        }
    }
    debug!(id = %inner.id, "connection supervisor stopped");
}
