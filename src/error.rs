use std::sync::Arc;
use thiserror::Error;

/// Result type for stream engine operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// A user-supplied failure carried through a stream without losing its identity
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that terminate a stream run
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// A user-supplied stage function failed
    #[error(transparent)]
    Stage(Cause),

    /// A peer broke the publish/subscribe contract
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A terminal that needs at least one element received none
    #[error("Stream completed without producing any element")]
    EmptyStream,

    /// The consumer side cancelled the run before it terminated
    #[error("Stream run was cancelled")]
    Cancelled,

    /// The graph cannot be run in the requested shape
    #[error("Invalid stage graph: {0}")]
    InvalidGraph(String),

    /// An element or result did not have the type its stage expected
    #[error("Element type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    /// Engine configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}

impl StreamError {
    /// Wrap an arbitrary user error as a stage failure
    pub fn stage<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamError::Stage(Arc::new(error))
    }

    /// Build a stage failure from a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        StreamError::Stage(Arc::new(Message(message.into())))
    }

    /// The user error behind a stage failure, if this is one
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            StreamError::Stage(cause) => Some(cause),
            _ => None,
        }
    }

    /// Downcast the user error behind a stage failure
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.cause().and_then(|cause| cause.downcast_ref::<E>())
    }

    /// The protocol violation behind this error, if any
    pub fn violation(&self) -> Option<ProtocolViolation> {
        match self {
            StreamError::Protocol(violation) => Some(*violation),
            _ => None,
        }
    }

    /// Whether `other` carries the very same user error instance
    pub fn is_same_cause(&self, other: &StreamError) -> bool {
        match (self.cause(), other.cause()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn type_mismatch<T>() -> Self {
        StreamError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }
    }
}

/// Ways a publisher or subscriber can break the protocol
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `request` was called with zero
    #[error("demand must be greater than zero")]
    NonPositiveRequest,

    /// `on_next` arrived without outstanding demand
    #[error("element delivered without outstanding demand")]
    DeliveryWithoutDemand,

    /// A unicast producer was subscribed twice
    #[error("producer already has a subscriber")]
    AlreadySubscribed,

    /// `on_subscribe` arrived while a subscription was already active
    #[error("subscriber received a second subscription")]
    DuplicateSubscription,
}

/// Plain-text stage failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Message(pub String);
