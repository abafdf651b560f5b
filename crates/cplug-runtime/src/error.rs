//! Crate-level error type
//!
//! Each FFI layer has its own error enum; `Error` wraps them for the plugin
//! surface and adds the failures that only make sense when binding a named
//! symbol.

use crate::ffi::{CallError, CallbackError, LoadError, MarshalError, PrepareError};
use thiserror::Error;

/// Errors from the plugin surface
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("symbol '{symbol}' cannot be bound as {ty}")]
    UnsupportedType { symbol: String, ty: String },

    #[error("symbol '{symbol}' holds a NULL char*")]
    NilPointer { symbol: String },

    #[error("symbol '{symbol}' is declared void and has no value to read")]
    NotAPointer { symbol: String },
}

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, Error>;
