//! Failure-injection tests for the reconnect, confirm and resubscribe
//! machinery, driven by a scripted in-memory broker. No RabbitMQ required.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use rabbit_keeper::broker::{
    Broker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream,
};
use rabbit_keeper::errors::{BrokerError, Error};
use rabbit_keeper::{
    Channel, ChannelOptions, ChannelPool, Connection, ConnectionOptions, ConnectionPool, Consumer,
    MessageHandler, UnsafeChannel, UnsafeChannelPool,
};

type Message = (Option<String>, Vec<u8>);

#[derive(Default)]
struct QueueSlot {
    buffered: VecDeque<Message>,
    consumers: Vec<mpsc::UnboundedSender<Message>>,
    next: usize,
}

/// Shared scripting state: counters plus the failure switches the tests flip.
#[derive(Default)]
struct MockState {
    dials: AtomicUsize,
    dial_failures: AtomicUsize,
    publishes: AtomicUsize,
    publish_fails_always: AtomicBool,
    publish_nacks: AtomicUsize,
    consumes: AtomicUsize,
    consume_fails_always: AtomicBool,
    queues: Mutex<HashMap<String, QueueSlot>>,
}

impl MockState {
    fn route(&self, queue: &str, reply_to: Option<&str>, payload: &[u8]) {
        let message = (reply_to.map(str::to_string), payload.to_vec());
        let mut queues = self.queues.lock().unwrap();
        let slot = queues.entry(queue.to_string()).or_default();
        slot.consumers.retain(|tx| !tx.is_closed());
        if slot.consumers.is_empty() {
            slot.buffered.push_back(message);
        } else {
            let idx = slot.next % slot.consumers.len();
            slot.next = slot.next.wrapping_add(1);
            let _ = slot.consumers[idx].send(message);
        }
    }

    fn attach_consumer(&self, queue: &str) -> mpsc::UnboundedReceiver<Message> {
        let mut queues = self.queues.lock().unwrap();
        let slot = queues.entry(queue.to_string()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(message) = slot.buffered.pop_front() {
            let _ = tx.send(message);
        }
        slot.consumers.push(tx);
        rx
    }
}

#[derive(Default)]
struct MockBroker {
    state: Arc<MockState>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockBroker {
    /// Drop every live connection, as a network partition would.
    fn kill_connections(&self) {
        for connection in self.connections.lock().unwrap().iter() {
            connection.alive.send_replace(false);
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn dial(&self, _addr: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let attempt = self.state.dials.fetch_add(1, Ordering::SeqCst);
        if attempt < self.state.dial_failures.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("injected dial failure".into()));
        }
        let connection = Arc::new(MockConnection {
            state: self.state.clone(),
            alive: watch::channel(true).0,
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

struct MockConnection {
    state: Arc<MockState>,
    alive: watch::Sender<bool>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        Ok(Arc::new(MockChannel {
            state: self.state.clone(),
            conn_alive: self.alive.subscribe(),
            alive: watch::channel(true).0,
        }))
    }

    async fn closed(&self) {
        let mut alive = self.alive.subscribe();
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    fn is_open(&self) -> bool {
        *self.alive.borrow()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.alive.send_replace(false);
        Ok(())
    }
}

struct MockChannel {
    state: Arc<MockState>,
    conn_alive: watch::Receiver<bool>,
    alive: watch::Sender<bool>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn qos(&self, _count: u16, _size: u32, _global: bool) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _expires_ms: Option<u32>) -> Result<(), BrokerError> {
        self.state
            .queues
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.state.queues.lock().unwrap().remove(name);
        Ok(())
    }

    async fn publish(&self, queue: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<Confirmation, BrokerError> {
        self.state.publishes.fetch_add(1, Ordering::SeqCst);
        if !self.is_open() {
            return Err(BrokerError::Publish("channel is dead".into()));
        }
        if self.state.publish_fails_always.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("injected publish failure".into()));
        }
        let nack = self
            .state
            .publish_nacks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if nack {
            return Ok(Confirmation::Nack);
        }
        self.state.route(queue, reply_to, payload);
        Ok(Confirmation::Ack)
    }

    async fn consume(&self, queue: &str, _tag: &str, _auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
        self.state.consumes.fetch_add(1, Ordering::SeqCst);
        if self.state.consume_fails_always.load(Ordering::SeqCst) {
            return Err(BrokerError::Consume("injected consume failure".into()));
        }
        let rx = self.state.attach_consumer(queue);
        let deliveries = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|(reply_to, payload)| {
                (Ok::<_, BrokerError>(Delivery::new(reply_to, payload)), rx)
            })
        });
        Ok(Box::pin(deliveries))
    }

    async fn closed(&self) {
        let mut own = self.alive.subscribe();
        let mut conn = self.conn_alive.clone();
        tokio::select! {
            _ = own.wait_for(|alive| !*alive) => {}
            _ = conn.wait_for(|alive| !*alive) => {}
        }
    }

    fn is_open(&self) -> bool {
        *self.alive.borrow() && *self.conn_alive.borrow()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.alive.send_replace(false);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _reply_to: Option<&str>, payload: &[u8]) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

fn fast_connection_options() -> ConnectionOptions {
    ConnectionOptions {
        reconnect_delay: Duration::from_millis(30),
    }
}

fn fast_channel_options() -> ChannelOptions {
    ChannelOptions {
        reinit_delay: Duration::from_millis(20),
        resend_delay: Duration::from_millis(60),
        resubscribe_delay: Duration::from_millis(20),
        max_resubscribe: 3,
        ..ChannelOptions::default()
    }
}

async fn mock_connection(broker: &Arc<MockBroker>) -> Connection {
    Connection::open_with(broker.clone(), "amqp://mock", fast_connection_options()).await
}

#[tokio::test]
async fn push_returns_only_after_positive_confirm() {
    let broker = Arc::new(MockBroker::default());
    broker.state.publish_nacks.store(1, Ordering::SeqCst);

    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;

    channel.push("q1", b"hello").await.unwrap();

    // One nacked attempt, one acked attempt.
    assert_eq!(broker.state.publishes.load(Ordering::SeqCst), 2);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_eventually_succeeds() {
    let broker = Arc::new(MockBroker::default());
    broker.state.dial_failures.store(3, Ordering::SeqCst);

    let connection = timeout(
        Duration::from_secs(2),
        Connection::open_with(broker.clone(), "amqp://mock", fast_connection_options()),
    )
    .await
    .expect("connected within the retry budget");

    assert!(connection.is_ready());
    assert!(connection.underlying().is_some());
    assert_eq!(broker.state.dials.load(Ordering::SeqCst), 4);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_safe() {
    let broker = Arc::new(MockBroker::default());
    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;

    channel.close().await.unwrap();
    assert!(matches!(channel.close().await, Err(Error::AlreadyClosed)));

    connection.close().await.unwrap();
    assert!(matches!(connection.close().await, Err(Error::AlreadyClosed)));
}

#[tokio::test]
async fn consume_resubscription_is_bounded() {
    let broker = Arc::new(MockBroker::default());
    broker.state.consume_fails_always.store(true, Ordering::SeqCst);

    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;
    let handler = Arc::new(RecordingHandler::default());

    let err = channel
        .consume_with_handler(CancellationToken::new(), "q1", handler)
        .await
        .unwrap_err();

    match err {
        Error::ResubscribeExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.state.consumes.load(Ordering::SeqCst), 3);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn pool_get_blocks_at_capacity() {
    let broker = Arc::new(MockBroker::default());
    let pool = Arc::new(
        ConnectionPool::open_with(broker.clone(), "amqp://mock", 2, fast_connection_options()).await,
    );

    let acquired = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..3 {
        let pool = pool.clone();
        let acquired = acquired.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let connection = pool.get().await.unwrap();
            acquired.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(connection);
        });
    }

    sleep(Duration::from_millis(100)).await;
    assert_eq!(acquired.load(Ordering::SeqCst), 2, "third get must block");

    let returned = rx.recv().await.unwrap();
    pool.put(returned).await;

    timeout(Duration::from_secs(1), async {
        while acquired.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("third get unblocks after put");
}

#[tokio::test]
async fn shutdown_aborts_push_retry() {
    let broker = Arc::new(MockBroker::default());
    broker.state.publish_fails_always.store(true, Ordering::SeqCst);

    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;

    let push = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("q1", b"payload").await }
    });

    sleep(Duration::from_millis(25)).await;
    connection.close().await.unwrap();

    // Must give up within roughly one resend interval, not keep retrying.
    let result = timeout(Duration::from_millis(200), push)
        .await
        .expect("push returns promptly after close")
        .unwrap();
    assert!(matches!(result, Err(Error::Shutdown)));
}

#[tokio::test]
async fn publishes_reach_the_handler_end_to_end() {
    let broker = Arc::new(MockBroker::default());
    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;

    channel.declare_queue("q1").await.unwrap();
    channel.push("q1", b"hello").await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let cancel = CancellationToken::new();
    let consume = tokio::spawn({
        let channel = channel.clone();
        let cancel = cancel.clone();
        let handler = handler.clone();
        async move { channel.consume_with_handler(cancel, "q1", handler).await }
    });

    timeout(Duration::from_secs(2), async {
        while !handler.seen.lock().unwrap().contains(&b"hello".to_vec()) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler sees the payload");

    cancel.cancel();
    let result = consume.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    channel.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn consume_once_takes_one_delivery_and_cleans_up() {
    let broker = Arc::new(MockBroker::default());
    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;

    channel.push_once("once-q", b"one-shot").await.unwrap();

    let cancel = CancellationToken::new();
    let payload = channel.consume_once(&cancel, "once-q").await.unwrap();
    assert_eq!(payload, b"one-shot");
    assert!(!broker.state.queues.lock().unwrap().contains_key("once-q"));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn channel_recovers_after_connection_loss() {
    let broker = Arc::new(MockBroker::default());
    let connection = mock_connection(&broker).await;
    let channel = Channel::open_with(&connection, fast_channel_options()).await;

    channel.push("q1", b"before").await.unwrap();

    broker.kill_connections();

    // push rides out the reconnect: dead-channel publishes fail until the
    // supervisors rebuild both layers on the redialed connection.
    timeout(Duration::from_secs(2), channel.push("q1", b"after"))
        .await
        .expect("push survives the reconnect")
        .unwrap();

    assert!(broker.state.dials.load(Ordering::SeqCst) >= 2);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn unsafe_push_does_not_retry() {
    let broker = Arc::new(MockBroker::default());
    broker.state.publish_fails_always.store(true, Ordering::SeqCst);

    let connection = mock_connection(&broker).await;
    let channel = UnsafeChannel::open_with(&connection, fast_channel_options()).await;

    let err = channel.push("q1", b"payload").await.unwrap_err();
    assert!(matches!(err, Error::Broker(BrokerError::Publish(_))));
    assert_eq!(broker.state.publishes.load(Ordering::SeqCst), 1);

    connection.close().await.unwrap();
}

#[tokio::test]
async fn unsafe_push_reports_not_connected_while_down() {
    let broker = Arc::new(MockBroker::default());
    let connection = mock_connection(&broker).await;
    let channel = UnsafeChannel::open_with(&connection, fast_channel_options()).await;

    // Take the broker away for good: the redial loop keeps failing, so the
    // channel supervisor never gets a new incarnation.
    broker.state.dial_failures.store(usize::MAX, Ordering::SeqCst);
    broker.kill_connections();
    sleep(Duration::from_millis(100)).await;

    let err = channel.push("q1", b"payload").await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn consumer_fans_out_and_aggregates_close() {
    let broker = Arc::new(MockBroker::default());
    let connection = mock_connection(&broker).await;
    let consumer = Arc::new(Consumer::on_connection(connection, 2, 1).await);
    assert_eq!(consumer.channels().len(), 2);

    consumer.channels()[0].push("jobs", b"job-1").await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let cancel = CancellationToken::new();
    let fanout = tokio::spawn({
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        let handler = handler.clone();
        async move { consumer.consume_with_handler(cancel, "jobs", handler).await }
    });

    timeout(Duration::from_secs(2), async {
        while !handler.seen.lock().unwrap().contains(&b"job-1".to_vec()) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fan-out delivers the job");

    // Cancellation counts as a clean exit for every loop.
    cancel.cancel();
    let result = fanout.await.unwrap();
    assert!(result.is_ok());

    consumer.close().await.unwrap();

    // Everything is closed already: two channels plus the connection all
    // object, and the failures come back together.
    let err = consumer.close().await.unwrap_err();
    assert!(matches!(err, Error::Multi(ref inner) if inner.len() == 3));
}

#[tokio::test]
async fn channel_pool_builds_per_connection() {
    let broker = Arc::new(MockBroker::default());
    let connections =
        ConnectionPool::open_with(broker.clone(), "amqp://mock", 2, fast_connection_options()).await;
    let channels = ChannelPool::open_with(&connections, 2, fast_channel_options())
        .await
        .unwrap();
    assert_eq!(channels.capacity(), 4);

    let mut held = Vec::new();
    for _ in 0..4 {
        let channel = timeout(Duration::from_secs(1), channels.get())
            .await
            .expect("pool has a free channel")
            .unwrap();
        assert!(channel.is_ready());
        held.push(channel);
    }
    for channel in held {
        channels.put(channel).await;
    }

    channels.close().await.unwrap();
    assert!(matches!(channels.get().await, Err(Error::PoolClosed)));

    let unsafe_channels = UnsafeChannelPool::open_with(&connections, 1, fast_channel_options())
        .await
        .unwrap();
    assert_eq!(unsafe_channels.capacity(), 2);
    let channel = unsafe_channels.get().await.unwrap();
    channel.push("q1", b"fire-and-forget").await.unwrap();
    unsafe_channels.put(channel).await;
    unsafe_channels.close().await.unwrap();

    connections.close().await.unwrap();
    assert!(matches!(connections.get().await, Err(Error::PoolClosed)));
}
