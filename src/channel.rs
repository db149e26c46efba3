//! Broker channels that re-create themselves when they drop.
//!
//! The supervisory loop mirrors the connection's: wait for the owning
//! connection to be ready, open a channel on it, arm confirm mode, then park
//! until the channel dies or someone shuts it down. [`Channel`] is the
//! reliable variant (publishes are broker-confirmed); the cheaper
//! fire-and-forget variant lives in [`crate::unsafe_channel`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, Confirmation, DeliveryStream};
use crate::connection::Connection;
use crate::errors::{Error, Result};
use crate::handler::MessageHandler;

/// Delay before re-creating a channel after an init failure.
pub const DEFAULT_REINIT_DELAY: Duration = Duration::from_secs(2);

/// Delay between publish attempts when the publish call itself failed.
pub const DEFAULT_RESEND_DELAY: Duration = Duration::from_secs(1);

/// Delay between consume re-subscription attempts.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Re-subscription attempts before a consume loop gives up.
pub const DEFAULT_MAX_RESUBSCRIBE: u32 = 5;

/// Broker-side idle expiry stamped on one-time queues.
pub const ONE_TIME_QUEUE_EXPIRY_MS: u32 = 60_000;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Unacknowledged deliveries a consumer may hold at once.
    pub prefetch_count: u16,
    /// Prefetch window in bytes. Kept for completeness; RabbitMQ ignores it.
    pub prefetch_size: u32,
    /// Apply QoS per-channel rather than per-consumer.
    pub global_qos: bool,
    pub reinit_delay: Duration,
    pub resend_delay: Duration,
    pub resubscribe_delay: Duration,
    pub max_resubscribe: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            prefetch_count: 1,
            prefetch_size: 0,
            global_qos: false,
            reinit_delay: DEFAULT_REINIT_DELAY,
            resend_delay: DEFAULT_RESEND_DELAY,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            max_resubscribe: DEFAULT_MAX_RESUBSCRIBE,
        }
    }
}

/// Supervisory core shared by [`Channel`] and
/// [`crate::unsafe_channel::UnsafeChannel`]; the only difference between the
/// two is whether init arms confirm mode.
pub(crate) struct ChannelCore {
    pub(crate) id: String,
    pub(crate) connection: Connection,
    pub(crate) confirm_mode: bool,
    pub(crate) options: ChannelOptions,
    pub(crate) failures: AtomicU32,
    handle: RwLock<Option<Arc<dyn BrokerChannel>>>,
    ready: watch::Sender<bool>,
    pub(crate) done: CancellationToken,
}

impl ChannelCore {
    pub(crate) async fn open(connection: &Connection, confirm_mode: bool, options: ChannelOptions) -> Arc<ChannelCore> {
        let (ready, _) = watch::channel(false);
        let core = Arc::new(ChannelCore {
            id: format!("chan-{}", &Uuid::new_v4().to_string()[..8]),
            connection: connection.clone(),
            confirm_mode,
            options,
            failures: AtomicU32::new(0),
            handle: RwLock::new(None),
            ready,
            done: CancellationToken::new(),
        });
        tokio::spawn(supervise(core.clone()));
        core.wait_ready().await;
        core
    }

    async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// The current channel incarnation, or [`Error::NotConnected`] while the
    /// supervisor is between incarnations.
    pub(crate) fn current(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotConnected)
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.done.is_cancelled() || self.connection.done_token().is_cancelled()
    }

    /// Wait out `delay`, bailing with [`Error::Shutdown`] if the channel or
    /// its connection closes first.
    pub(crate) async fn pause(&self, delay: Duration) -> Result<()> {
        let connection_done = self.connection.done_token();
        tokio::select! {
            _ = self.done.cancelled() => Err(Error::Shutdown),
            _ = connection_done.cancelled() => Err(Error::Shutdown),
            _ = sleep(delay) => Ok(()),
        }
    }

    /// Single publish attempt against the current incarnation.
    pub(crate) async fn publish(&self, queue: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<Confirmation> {
        let channel = self.current()?;
        Ok(channel.publish(queue, reply_to, payload).await?)
    }

    /// Apply QoS and open a delivery stream on the current incarnation.
    pub(crate) async fn subscribe(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let channel = self.current()?;
        self.subscribe_on(&channel, queue, auto_ack).await
    }

    pub(crate) async fn subscribe_on(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        let options = &self.options;
        channel
            .qos(options.prefetch_count, options.prefetch_size, options.global_qos)
            .await?;
        let tag = format!("{}-{}", self.id, &Uuid::new_v4().to_string()[..8]);
        Ok(channel.consume(queue, &tag, auto_ack).await?)
    }

    pub(crate) async fn declare_queue(&self, name: &str, expires_ms: Option<u32>) -> Result<()> {
        let channel = self.current()?;
        Ok(channel.declare_queue(name, expires_ms).await?)
    }

    pub(crate) async fn delete_queue(&self, name: &str) -> Result<()> {
        let channel = self.current()?;
        Ok(channel.delete_queue(name).await?)
    }

    pub(crate) async fn close(&self) -> Result<()> {
        let was_ready = self.ready.send_replace(false);
        if !was_ready {
            return Err(Error::AlreadyClosed);
        }

        self.done.cancel();
        let handle = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = handle {
            channel.close().await?;
        }
        info!(id = %self.id, "channel closed");
        Ok(())
    }
}

async fn supervise(core: Arc<ChannelCore>) {
    let connection_done = core.connection.done_token();
    loop {
        core.ready.send_replace(false);
        *core.handle.write().unwrap_or_else(PoisonError::into_inner) = None;

        tokio::select! {
            _ = core.done.cancelled() => break,
            _ = connection_done.cancelled() => break,
            _ = core.connection.wait_ready() => {}
        }

        let channel = match init(&core).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(id = %core.id, error = %e, "channel init failed, retrying");
                tokio::select! {
                    _ = core.done.cancelled() => break,
                    _ = connection_done.cancelled() => break,
                    _ = sleep(core.options.reinit_delay) => continue,
                }
            }
        };

        *core.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
        core.ready.send_replace(true);
        debug!(id = %core.id, confirm = core.confirm_mode, "channel ready");

        tokio::select! {
            _ = core.done.cancelled() => break,
            _ = connection_done.cancelled() => break,
            _ = channel.closed() => {
                warn!(id = %core.id, "channel closed by broker, reinitializing");
            }
        }
    }
    debug!(id = %core.id, "channel supervisor stopped");
}

async fn init(core: &ChannelCore) -> Result<Arc<dyn BrokerChannel>> {
    let connection = core.connection.underlying().ok_or(Error::NotConnected)?;
    let channel = connection.open_channel().await?;
    if core.confirm_mode {
        // Confirm mode must be armed before the first publish on this
        // incarnation; everything reliable rests on it.
        channel.enable_confirms().await?;
    }
    Ok(channel)
}

/// A reliable channel: publishes block until the broker confirms them and a
/// consume loop survives channel loss.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    /// Open a channel on a ready connection, blocking until usable.
    pub async fn open(connection: &Connection) -> Self {
        Self::open_with(connection, ChannelOptions::default()).await
    }

    pub async fn open_with_prefetch(connection: &Connection, prefetch_count: u16) -> Self {
        Self::open_with(
            connection,
            ChannelOptions {
                prefetch_count,
                ..ChannelOptions::default()
            },
        )
        .await
    }

    pub async fn open_with(connection: &Connection, options: ChannelOptions) -> Self {
        Channel {
            core: ChannelCore::open(connection, true, options).await,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Declare a durable, non-exclusive, non-auto-delete queue.
    pub async fn declare_queue(&self, name: &str) -> Result<()> {
        self.core.declare_queue(name, None).await
    }

    /// Declare a durable queue that the broker removes after
    /// [`ONE_TIME_QUEUE_EXPIRY_MS`] of inactivity.
    pub async fn declare_one_time_queue(&self, name: &str) -> Result<()> {
        self.core.declare_queue(name, Some(ONE_TIME_QUEUE_EXPIRY_MS)).await
    }

    /// Publish with at-least-once semantics: retries until the broker
    /// positively confirms the message, or the channel/connection shuts down.
    pub async fn push(&self, queue: &str, data: &[u8]) -> Result<()> {
        self.push_message(queue, None, data).await
    }

    /// [`push`](Channel::push) with a reply-to queue attached, for
    /// request/response flows.
    pub async fn push_with_reply_to(&self, queue: &str, reply_to: &str, data: &[u8]) -> Result<()> {
        self.push_message(queue, Some(reply_to), data).await
    }

    /// Declare a one-time queue, then push to it.
    pub async fn push_once(&self, queue: &str, data: &[u8]) -> Result<()> {
        self.declare_one_time_queue(queue).await?;
        self.push(queue, data).await
    }

    async fn push_message(&self, queue: &str, reply_to: Option<&str>, data: &[u8]) -> Result<()> {
        loop {
            if self.core.shutting_down() {
                return Err(Error::Shutdown);
            }
            match self.core.publish(queue, reply_to, data).await {
                Ok(Confirmation::Ack) => {
                    debug!(id = %self.core.id, queue, "publish confirmed");
                    return Ok(());
                }
                Ok(_) => {
                    // Nacked: retry from the top right away.
                    warn!(id = %self.core.id, queue, "publish not confirmed, retrying");
                }
                Err(Error::Broker(e)) if !e.is_transient() => return Err(Error::Broker(e)),
                Err(e) => {
                    warn!(id = %self.core.id, queue, error = %e, "publish failed, retrying");
                    self.core.pause(self.core.options.resend_delay).await?;
                }
            }
        }
    }

    /// Open a delivery stream; deliveries must be acked by the caller.
    pub async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.core.subscribe(queue, false).await
    }

    /// Open an auto-acknowledging delivery stream.
    pub async fn consume_ack(&self, queue: &str) -> Result<DeliveryStream> {
        self.core.subscribe(queue, true).await
    }

    /// Take exactly one delivery from a one-time queue, ack it, delete the
    /// queue and return the payload.
    pub async fn consume_once(&self, cancel: &CancellationToken, queue: &str) -> Result<Vec<u8>> {
        self.declare_one_time_queue(queue).await?;
        let mut deliveries = self.core.subscribe(queue, false).await?;

        let delivery = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(Error::Broker(e)),
                None => return Err(Error::NotConnected),
            },
        };

        let payload = delivery.payload.clone();
        delivery.ack().await?;
        self.core.delete_queue(queue).await?;
        Ok(payload)
    }

    /// Long-running consume loop that resubscribes itself when the channel
    /// drops, up to `max_resubscribe` failed attempts.
    ///
    /// Every delivery is handed to `handler` and then acknowledged, whether or
    /// not the handler succeeded: a handler failure is logged, never
    /// redelivered. That keeps one poisoned message from wedging the queue at
    /// the cost of losing its processing.
    pub async fn consume_with_handler(
        &self,
        cancel: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let connection_done = self.core.connection.done_token();
        info!(id = %self.core.id, queue, "consume loop started");

        loop {
            let (mut deliveries, channel) = self.resubscribe(&cancel, queue).await?;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = self.core.done.cancelled() => return Err(Error::Shutdown),
                    _ = connection_done.cancelled() => return Err(Error::Shutdown),
                    _ = channel.closed() => {
                        warn!(id = %self.core.id, queue, "channel closed mid-consume, resubscribing");
                        break;
                    }
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            if let Err(e) = handler.handle(delivery.reply_to.as_deref(), &delivery.payload).await {
                                error!(id = %self.core.id, queue, error = %e, "message handler failed");
                            }
                            if let Err(e) = delivery.ack().await {
                                warn!(id = %self.core.id, queue, error = %e, "delivery ack failed");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(id = %self.core.id, queue, error = %e, "delivery stream broke, resubscribing");
                            break;
                        }
                        None => {
                            warn!(id = %self.core.id, queue, "delivery stream ended, resubscribing");
                            break;
                        }
                    },
                }
            }
        }
    }

    async fn resubscribe(
        &self,
        cancel: &CancellationToken,
        queue: &str,
    ) -> Result<(DeliveryStream, Arc<dyn BrokerChannel>)> {
        let connection_done = self.core.connection.done_token();
        loop {
            let subscription = match self.core.current() {
                Ok(channel) => self
                    .core
                    .subscribe_on(&channel, queue, false)
                    .await
                    .map(|deliveries| (deliveries, channel)),
                Err(e) => Err(e),
            };

            match subscription {
                Ok(ready) => return Ok(ready),
                Err(e) => {
                    // The failure counter is monotonic for the lifetime of the
                    // channel, so a flapping subscription eventually gives up
                    // even when individual rounds look fine.
                    let attempts = self.core.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(id = %self.core.id, queue, error = %e, attempts, "consume subscription failed");
                    if attempts >= self.core.options.max_resubscribe {
                        return Err(Error::ResubscribeExhausted {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = self.core.done.cancelled() => return Err(Error::Shutdown),
                        _ = connection_done.cancelled() => return Err(Error::Shutdown),
                        _ = sleep(self.core.options.resubscribe_delay) => {}
                    }
                }
            }
        }
    }

    /// Shut the channel down. Errors with [`Error::AlreadyClosed`] when it is
    /// not currently ready.
    pub async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}
