//! Broker error types

use thiserror::Error;

/// Error type for stream broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Broker unreachable or connection lost
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Stream refused an append (capped retention exhausted)
    #[error("stream full: {0}")]
    StreamFull(String),

    /// Stream operation failed
    #[error("stream error: {0}")]
    Stream(String),

    /// Consumer group operation failed
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid broker configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<deadpool_redis::PoolError> for BrokerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for BrokerError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            BrokerError::Unavailable(err.to_string())
        } else {
            BrokerError::Stream(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}
