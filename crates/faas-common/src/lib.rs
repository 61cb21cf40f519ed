//! Shared data model and error type for the invoker engine and its host binary.

use std::fmt::Display;

use thiserror::Error;
pub use uuid;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Executor Error: {0}")]
    Executor(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FaasError>;

/// Opaque stable identifier for a specific function code revision. Two
/// activations carrying the same `FunctionId` are guaranteed to execute
/// identical code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct FunctionId(pub String);

impl Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(s: &str) -> Self {
        FunctionId(s.to_string())
    }
}

impl From<String> for FunctionId {
    fn from(s: String) -> Self {
        FunctionId(s)
    }
}

/// Identifier for one activation, chosen by the external controller and used
/// to correlate `InvocationResult`s back to their request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TransactionId(pub String);

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        TransactionId(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        TransactionId(s)
    }
}

/// Outcome of one execution attempt, as recorded in `ExecStats::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Failure,
}

/// Measured timings and outcome of one activation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecStats {
    pub init_time_ms: u64,
    pub run_time_ms: u64,
    pub status: ExecStatus,
}

impl ExecStats {
    pub fn success(init_time_ms: u64, run_time_ms: u64) -> Self {
        Self {
            init_time_ms,
            run_time_ms,
            status: ExecStatus::Success,
        }
    }

    pub fn failure(init_time_ms: u64, run_time_ms: u64) -> Self {
        Self {
            init_time_ms,
            run_time_ms,
            status: ExecStatus::Failure,
        }
    }
}

/// Identifying and measurement metadata carried by both an `Invocation` and
/// its matching `InvocationResult`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvocationInfo {
    pub transaction_id: TransactionId,
    pub function_id: FunctionId,
    pub activation_id: Uuid,
    pub args_size: usize,
    pub exec_stats: ExecStats,
}

impl InvocationInfo {
    pub fn new(transaction_id: TransactionId, function_id: FunctionId, args_size: usize) -> Self {
        Self {
            transaction_id,
            function_id,
            activation_id: Uuid::new_v4(),
            args_size,
            exec_stats: ExecStats {
                init_time_ms: 0,
                run_time_ms: 0,
                status: ExecStatus::Failure,
            },
        }
    }
}

/// An activation pulled off the work queue. Immutable once enqueued: nothing
/// in this crate ever mutates `args` or `code` after construction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Invocation {
    pub info: InvocationInfo,
    /// JSON-valued arguments string, already stripped of any outer envelope
    /// by the Controller.
    pub args: String,
    /// JS source for the function. Empty when the function is already
    /// initialized on a warm/hot path and no (re)compilation is needed.
    pub code: String,
}

impl Invocation {
    pub fn new(
        transaction_id: impl Into<TransactionId>,
        function_id: impl Into<FunctionId>,
        args: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        let args = args.into();
        let function_id = function_id.into();
        let info = InvocationInfo::new(transaction_id.into(), function_id, args.len());
        Self {
            info,
            args,
            code: code.into(),
        }
    }
}

/// Produced at most once per `Invocation` (I7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvocationResult {
    pub info: InvocationInfo,
    pub reply: String,
}

impl Display for InvocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InvocationResult(transaction_id: {}, status: {:?}, reply: {})",
            self.info.transaction_id, self.info.exec_stats.status, self.reply
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_round_trips_through_json() {
        let inv = Invocation::new("tid-1", "fid-a", r#"{"k":"v"}"#, "function main(a){}");
        let json = serde_json::to_string(&inv).unwrap();
        let back: Invocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.info.transaction_id, inv.info.transaction_id);
        assert_eq!(back.info.function_id, inv.info.function_id);
        assert_eq!(back.args, inv.args);
    }

    #[test]
    fn exec_stats_serialize_status_lowercase() {
        let stats = ExecStats::success(10, 20);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"status\":\"success\""));
    }
}
