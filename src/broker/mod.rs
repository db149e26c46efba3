//! The seam between the reconnect machinery and the wire-level broker client.
//!
//! Everything above this module talks to the broker through these traits; the
//! production implementation in [`amqp`] maps them onto `lapin`. Keeping the
//! seam small is what lets the supervisory and retry logic run against a
//! scripted broker in tests.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::BrokerError;

pub mod amqp;

pub use amqp::AmqpBroker;

/// Outcome of a publish as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The channel is not in confirm mode; the publish was only handed off.
    NotRequested,
}

/// Stream of inbound deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait DeliveryAck: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One message handed to a consumer. The payload is opaque bytes; decoding is
/// the application's business.
pub struct Delivery {
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
    acker: Option<Box<dyn DeliveryAck>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgment (auto-ack subscriptions).
    pub fn new(reply_to: Option<String>, payload: Vec<u8>) -> Self {
        Delivery {
            reply_to,
            payload,
            acker: None,
        }
    }

    pub fn with_acker(reply_to: Option<String>, payload: Vec<u8>, acker: Box<dyn DeliveryAck>) -> Self {
        Delivery {
            reply_to,
            payload,
            acker: Some(acker),
        }
    }

    /// Acknowledge the delivery. A no-op for auto-acked subscriptions.
    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("reply_to", &self.reply_to)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Dials physical broker connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One physical connection. Channels are opened on top of it.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolves once the connection is no longer usable.
    async fn closed(&self);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// One broker channel: the unit publishes and subscriptions run on.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Put the channel into confirm mode. Must happen before any publish whose
    /// confirmation matters.
    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<(), BrokerError>;

    /// Declare a durable queue. `expires_ms` adds a broker-side idle expiry so
    /// ad-hoc queues clean themselves up.
    async fn declare_queue(&self, name: &str, expires_ms: Option<u32>) -> Result<(), BrokerError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Publish to a named queue and report the broker's confirmation. On a
    /// channel without confirm mode the result is [`Confirmation::NotRequested`].
    async fn publish(&self, queue: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<Confirmation, BrokerError>;

    async fn consume(&self, queue: &str, tag: &str, auto_ack: bool) -> Result<DeliveryStream, BrokerError>;

    /// Resolves once the channel is no longer usable.
    async fn closed(&self);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}
