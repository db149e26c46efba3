//! Fan one connection out to several consuming channels.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::Channel;
use crate::connection::Connection;
use crate::errors::{Error, Result};
use crate::handler::MessageHandler;

/// One connection, `n` reliable channels, `n` concurrent consume loops over
/// the same queue (competing consumers on the broker side).
pub struct Consumer {
    connection: Connection,
    channels: Vec<Channel>,
}

impl Consumer {
    /// Dial `addr` and build the fan-out, blocking until every channel is
    /// ready.
    pub async fn open(addr: &str, num_channels: usize, prefetch_count: u16) -> Self {
        let connection = Connection::open(addr).await;
        Self::on_connection(connection, num_channels, prefetch_count).await
    }

    /// Build the fan-out on an existing connection.
    pub async fn on_connection(connection: Connection, num_channels: usize, prefetch_count: u16) -> Self {
        let mut channels = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            channels.push(Channel::open_with_prefetch(&connection, prefetch_count).await);
        }
        info!(id = %connection.id(), channels = channels.len(), "consumer ready");
        Consumer { connection, channels }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Run every channel's self-healing consume loop against `queue` and wait
    /// for all of them to finish.
    ///
    /// Loops that ended because of `cancel` or shutdown count as clean exits;
    /// anything else (resubscribe exhaustion, panics) is accumulated and
    /// returned once every loop has stopped.
    pub async fn consume_with_handler(
        &self,
        cancel: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let tasks: Vec<_> = self
            .channels
            .iter()
            .map(|channel| {
                let channel = channel.clone();
                let cancel = cancel.clone();
                let handler = handler.clone();
                let queue = queue.to_string();
                tokio::spawn(async move { channel.consume_with_handler(cancel, &queue, handler).await })
            })
            .collect();

        let mut failures = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(())) | Ok(Err(Error::Cancelled)) | Ok(Err(Error::Shutdown)) => {}
                Ok(Err(e)) => failures.push(e),
                Err(e) => failures.push(Error::Task(e.to_string())),
            }
        }
        Error::from_failures(failures)
    }

    /// Close every channel, then the connection, accumulating every failure
    /// instead of stopping at the first.
    pub async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.close().await {
                failures.push(e);
            }
        }
        if let Err(e) = self.connection.close().await {
            failures.push(e);
        }
        Error::from_failures(failures)
    }
}
