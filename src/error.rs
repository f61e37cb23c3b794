//! Engine error taxonomy.
//!
//! Every engine operation returns a `Result<T, EngineError>`; no panics cross
//! the public API on the request path. Mapping to wire status codes lives in
//! [`crate::codec`], which keeps the engine itself wire-format-agnostic.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists or cas mismatch")]
    KeyExists,

    #[error("key or value too large: nkey={nkey} nbytes={nbytes}")]
    TooLarge { nkey: usize, nbytes: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not stored")]
    NotStored,

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation not supported")]
    NotSupported,
}

pub type EngineResult<T> = Result<T, EngineError>;
