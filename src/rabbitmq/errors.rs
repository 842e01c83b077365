// src/rabbitmq/errors.rs

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to reach broker at {address}: {reason}")]
    Network { address: String, reason: String },

    #[error("broker refused credentials for user '{username}'")]
    Auth { username: String },

    #[error("vhost '{0}' is not available to this user")]
    VhostNotAllowed(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection is closed")]
    Closed,

    #[error("channel error: {0}")]
    Channel(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker rejected the message: {reason}")]
    Rejected { reason: String },

    #[error("no publisher confirm received within {0:?}")]
    Timeout(Duration),

    #[error("channel lost mid-publish: {0}")]
    ConnectionLost(String),

    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by a message handler, or the panic that took it down.
///
/// Never escapes the consume loop: it is turned into a negative
/// acknowledgement for the delivery that caused it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<BoxError>,
    panicked: bool,
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            panicked: false,
        }
    }

    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
            panicked: false,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self {
            message: format!("handler panicked: {}", detail),
            source: None,
            panicked: true,
        }
    }

    pub fn is_panic(&self) -> bool {
        self.panicked
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::msg(format!("{:#}", error))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::msg(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::msg(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidNameError {
    #[error("queue name must not be empty")]
    Empty,

    #[error("queue name '{0}' exceeds 255 bytes")]
    TooLong(String),

    #[error("queue name '{0}' uses the reserved 'amq.' prefix")]
    ReservedPrefix(String),

    #[error("queue '{0}' cannot dead-letter into itself")]
    DeadLetterLoop(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("queue '{queue}' does not exist")]
pub struct NotFoundError {
    pub queue: String,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),

    #[error("queue declaration conflicts with the existing queue: {0}")]
    PreconditionFailed(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("queue topology could not be declared: {0}")]
    Topology(String),

    #[error("channel lost while consuming: {0}")]
    ChannelLost(String),

    #[error("consumer is already running")]
    AlreadyRunning,
}

impl From<AdminError> for ConsumeError {
    fn from(error: AdminError) -> Self {
        match error {
            AdminError::NotFound(e) => ConsumeError::NotFound(e),
            AdminError::InvalidName(e) => ConsumeError::InvalidName(e),
            AdminError::Connection(e) => ConsumeError::Connection(e),
            AdminError::PreconditionFailed(reason) => ConsumeError::Topology(reason),
        }
    }
}
