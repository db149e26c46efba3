use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use rabbit_keeper::{AmqpBroker, Channel, Config, Connection, MessageHandler};

#[derive(Debug, Serialize, Deserialize)]
struct Event {
    id: Uuid,
    created_at: DateTime<Utc>,
    body: String,
}

struct PrintHandler;

#[async_trait::async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, _reply_to: Option<&str>, payload: &[u8]) -> Result<()> {
        let event: Event = serde_json::from_slice(payload)?;
        info!(id = %event.id, body = %event.body, "handled event");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    info!(addr = %config.amqp_addr, "connecting");

    let connection =
        Connection::open_with(Arc::new(AmqpBroker), &config.amqp_addr, config.connection_options()).await;
    let channel = Channel::open_with(&connection, config.channel_options()).await;
    channel.declare_queue("events").await?;

    let cancel = CancellationToken::new();

    let consume_channel = channel.clone();
    let consume_cancel = cancel.clone();
    let consume = tokio::spawn(async move {
        if let Err(e) = consume_channel
            .consume_with_handler(consume_cancel, "events", Arc::new(PrintHandler))
            .await
        {
            info!(error = %e, "consume loop ended");
        }
    });

    let publish_channel = channel.clone();
    let publish = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let event = Event {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                body: "ping".to_string(),
            };
            let payload = match serde_json::to_vec(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "event serialization failed");
                    continue;
                }
            };
            if let Err(e) = publish_channel.push("events", &payload).await {
                error!(error = %e, "publish failed");
                break;
            }
            info!(id = %event.id, "published event");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    publish.abort();
    let _ = consume.await;
    let _ = channel.close().await;
    let _ = connection.close().await;
    Ok(())
}
