use async_trait::async_trait;

/// Application-side message processing.
///
/// Invoked once per delivered message; `reply_to` carries the response queue
/// when the publisher asked for one. Errors are logged by the consume loop,
/// which still acknowledges the delivery afterwards.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, reply_to: Option<&str>, payload: &[u8]) -> anyhow::Result<()>;
}
