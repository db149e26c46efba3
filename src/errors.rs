use thiserror::Error;

/// Failures reported by the broker layer itself.
///
/// Variants are grouped by the operation that produced them so retry policy
/// can be decided by matching, not by sniffing error strings.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),

    #[error("broker channel failed: {0}")]
    Channel(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("queue operation rejected: {0}")]
    Queue(String),
}

impl BrokerError {
    /// Whether a retry at a later point can reasonably succeed.
    ///
    /// Queue rejections are caller errors (bad name, bad arguments) and a
    /// failed acknowledge refers to a delivery that no longer exists; neither
    /// gets better by waiting.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Connect(_)
            | BrokerError::Channel(_)
            | BrokerError::Publish(_)
            | BrokerError::Consume(_) => true,
            BrokerError::Queue(_) | BrokerError::Ack(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The connection or channel is shutting down; the operation was abandoned.
    #[error("shutting down")]
    Shutdown,

    /// A second close on something that is already closed (or never recovered).
    #[error("already closed: not connected to the broker")]
    AlreadyClosed,

    #[error("not connected to the broker")]
    NotConnected,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    #[error("resubscribe gave up after {attempts} attempts: {source}")]
    ResubscribeExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("pool is closed")]
    PoolClosed,

    #[error("consume task failed: {0}")]
    Task(String),

    #[error("finished with {} failures", .0.len())]
    Multi(Vec<Error>),
}

impl Error {
    /// Fold errors accumulated along a close path into one result.
    pub fn from_failures(mut failures: Vec<Error>) -> Result<()> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(Error::Multi(failures)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
