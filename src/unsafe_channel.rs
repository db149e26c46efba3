//! Fire-and-forget channel variant.
//!
//! Same supervisory shape as [`crate::channel::Channel`], but init never arms
//! confirm mode and a push is a single publish call: no confirmation wait, no
//! retry. Meant for high-throughput traffic that tolerates loss.

use std::sync::Arc;

use tracing::debug;

use crate::channel::{ChannelCore, ChannelOptions, ONE_TIME_QUEUE_EXPIRY_MS};
use crate::connection::Connection;
use crate::errors::{Error, Result};

#[derive(Clone)]
pub struct UnsafeChannel {
    core: Arc<ChannelCore>,
}

impl UnsafeChannel {
    pub async fn open(connection: &Connection) -> Self {
        Self::open_with(connection, ChannelOptions::default()).await
    }

    pub async fn open_with(connection: &Connection, options: ChannelOptions) -> Self {
        UnsafeChannel {
            core: ChannelCore::open(connection, false, options).await,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    pub async fn declare_queue(&self, name: &str) -> Result<()> {
        self.core.declare_queue(name, None).await
    }

    pub async fn declare_one_time_queue(&self, name: &str) -> Result<()> {
        self.core.declare_queue(name, Some(ONE_TIME_QUEUE_EXPIRY_MS)).await
    }

    /// Publish without a delivery guarantee. [`Error::NotConnected`] when the
    /// channel is currently down; otherwise whatever the publish call said.
    pub async fn push(&self, queue: &str, data: &[u8]) -> Result<()> {
        self.push_message(queue, None, data).await
    }

    pub async fn push_with_reply_to(&self, queue: &str, reply_to: &str, data: &[u8]) -> Result<()> {
        self.push_message(queue, Some(reply_to), data).await
    }

    async fn push_message(&self, queue: &str, reply_to: Option<&str>, data: &[u8]) -> Result<()> {
        if self.core.shutting_down() {
            return Err(Error::Shutdown);
        }
        self.core.publish(queue, reply_to, data).await?;
        debug!(id = %self.core.id, queue, "publish handed off");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}
