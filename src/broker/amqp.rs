//! `lapin`-backed implementation of the broker seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    BasicProperties, Channel as LapinChannel, Connection as LapinConnection, ConnectionProperties,
};

use super::{
    Broker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryAck, DeliveryStream,
};
use crate::errors::BrokerError;

/// Sampling interval of the liveness watchdog behind `closed()`.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

/// AMQP delivery mode 2: persist messages on durable queues.
const PERSISTENT: u8 = 2;

/// Dials real AMQP connections through `lapin`.
pub struct AmqpBroker;

#[async_trait]
impl Broker for AmqpBroker {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = LapinConnection::connect(addr, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: LapinConnection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn closed(&self) {
        while self.inner.status().connected() {
            tokio::time::sleep(WATCHDOG_INTERVAL).await;
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(0, "closing")
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))
    }
}

struct AmqpChannel {
    inner: LapinChannel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn qos(&self, prefetch_count: u16, _prefetch_size: u32, global: bool) -> Result<(), BrokerError> {
        // RabbitMQ never implemented per-channel prefetch size; only the count
        // and the global flag go over the wire.
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn declare_queue(&self, name: &str, expires_ms: Option<u32>) -> Result<(), BrokerError> {
        let mut args = FieldTable::default();
        if let Some(ms) = expires_ms {
            args.insert("x-expires".into(), AMQPValue::LongUInt(ms));
        }
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Queue(e.to_string()))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Queue(e.to_string()))
    }

    async fn publish(&self, queue: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<Confirmation, BrokerError> {
        let mut properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
        if let Some(reply_to) = reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        // Publishing through the default exchange routes straight to the queue.
        let confirm = self
            .inner
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(match confirm {
            LapinConfirmation::Ack(_) => Confirmation::Ack,
            LapinConfirmation::Nack(_) => Confirmation::Nack,
            LapinConfirmation::NotRequested => Confirmation::NotRequested,
        })
    }

    async fn consume(&self, queue: &str, tag: &str, auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let deliveries = consumer.map(move |item| {
            item.map(|delivery| {
                let reply_to = delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|queue| queue.as_str().to_string());
                let payload = delivery.data.clone();
                if auto_ack {
                    Delivery::new(reply_to, payload)
                } else {
                    Delivery::with_acker(reply_to, payload, Box::new(AmqpAck { delivery }))
                }
            })
            .map_err(|e| BrokerError::Consume(e.to_string()))
        });
        Ok(Box::pin(deliveries))
    }

    async fn closed(&self) {
        while self.inner.status().connected() {
            tokio::time::sleep(WATCHDOG_INTERVAL).await;
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(0, "closing")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}

struct AmqpAck {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl DeliveryAck for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
