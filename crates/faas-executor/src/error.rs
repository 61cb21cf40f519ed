//! Crate-level error type for the invoker engine.

use faas_common::FaasError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timeout waiting for {phase} (transaction {transaction_id})")]
    Timeout {
        phase: &'static str,
        transaction_id: String,
    },

    #[error("transport error on transaction {transaction_id}: {source}")]
    Transport {
        transaction_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error on transaction {transaction_id}: {detail}")]
    Protocol {
        transaction_id: String,
        detail: String,
    },

    #[error("capacity full: {0}")]
    CapacityFull(&'static str),

    #[error("duplicate transaction id: {0}")]
    DuplicateTransaction(String),

    #[error("instance manager error: {0}")]
    InstanceManager(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for FaasError {
    fn from(err: EngineError) -> Self {
        FaasError::Executor(err.to_string())
    }
}
