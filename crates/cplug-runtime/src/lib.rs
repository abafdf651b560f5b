//! cplug runtime - dynamic calls into native libraries
//!
//! This library lets a host program load a shared library at run time and
//! call C functions whose signatures are only known at run time:
//! - Type descriptors and call interfaces (libffi)
//! - Marshaling between host values and native slots
//! - Bound functions and callbacks
//! - Library loading with search-path resolution
//! - Logging setup for the events the runtime emits

/// cplug runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod ffi;
pub mod logging;
pub mod plugin;
pub mod value;

pub use error::{Error, Result};
pub use ffi::{
    create_callback, describe, invoke, Abi, Callback, Cif, ExternFunction, ExternType,
    FnSignature, HostType, Library, LibraryLoader, OpenFlags, Signature,
};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use plugin::{bind_symbol, BoundValue, Plugin};
pub use value::{RawAddress, Value};
