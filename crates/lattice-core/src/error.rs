//! Caller-visible RPC error taxonomy.
//!
//! Handlers return these; the fabric turns them into CALLERROR frames.
//! A handler-level error never drops the connection.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Missing, wrong-typed, or wrong-arity arguments. Caller must fix and retry.
    #[error("invalid arguments")]
    InvalidArguments,
    /// Unknown api key, user id, or record. A normal negative answer.
    #[error("not found")]
    NotFound,
    /// The single outcome of a lost once race.
    #[error("already taken")]
    AlreadyTaken,
    /// CALL named a procedure no handler is bound to.
    #[error("no such procedure")]
    UnknownProcedure,
    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Stable error uri carried in the CALLERROR frame.
    pub fn uri(&self) -> &'static str {
        match self {
            RpcError::InvalidArguments => "error.invalid-arguments",
            RpcError::NotFound => "error.not-found",
            RpcError::AlreadyTaken => "error.already-taken",
            RpcError::UnknownProcedure => "error.unknown-procedure",
            RpcError::Internal(_) => "error.internal",
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::Internal(message.into())
    }
}
