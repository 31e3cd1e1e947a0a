//! Process- and session-level error types.
//!
//! `ProxyError` covers failures that cross a task boundary as a `Result`; wire-level Stratum
//! errors that travel to the miner as a JSON-RPC error array are `StratumError` values
//! (`crate::constants`), not `Error`s.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to parse json-rpc line: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("network io: {0}")]
    NetworkIo(#[from] std::io::Error),

    #[error("session id space exhausted")]
    ResourceExhausted,

    #[error("fatal configuration error: {0}")]
    ConfigFatal(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
