//! Self-healing RabbitMQ client layer.
//!
//! Plain broker clients leave three problems to the caller: noticing that a
//! connection or channel died and bringing it back, making sure a publish
//! actually reached the broker, and keeping a consume loop alive across
//! channel churn. This crate owns all three:
//!
//! - [`Connection`] redials forever on a fixed interval until explicitly
//!   closed, with a supervisory task per connection.
//! - [`Channel`] layers confirm-mode publishing ([`Channel::push`] blocks
//!   until the broker acks, retrying as needed) and a self-healing consume
//!   loop ([`Channel::consume_with_handler`]) on top of a connection.
//!   [`UnsafeChannel`] is the fire-and-forget sibling.
//! - [`Consumer`] fans one connection out to N consuming channels, and the
//!   pool types hand out pre-built ready instances under backpressure.
//!
//! Delivery is at-least-once: duplicates are possible and are the message
//! handler's problem. Payloads are opaque bytes.

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod pool;
pub mod unsafe_channel;

pub use broker::{AmqpBroker, Broker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream};
pub use channel::{Channel, ChannelOptions};
pub use config::Config;
pub use connection::{Connection, ConnectionOptions};
pub use consumer::Consumer;
pub use errors::{BrokerError, Error, Result};
pub use handler::MessageHandler;
pub use pool::{ChannelPool, ConnectionPool, UnsafeChannelPool};
pub use unsafe_channel::UnsafeChannel;
