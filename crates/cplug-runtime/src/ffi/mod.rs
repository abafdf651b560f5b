//! Foreign function interface
//!
//! Calls C functions whose signatures are only known at run time:
//! - `types`: supported C scalar kinds and their descriptors
//! - `cif`: prepared call interfaces (libffi)
//! - `marshal`: host values to native slots and back
//! - `caller`: invocation and bound functions
//! - `callbacks`: host closures as C function pointers
//! - `loader`: opening libraries and resolving symbols
//!
//! # Safety
//!
//! Nothing here can verify that a native function really has the signature
//! it is bound with. The entry points that rely on it are `unsafe`; a
//! mismatch or a fault inside native code is not an error, it is undefined
//! behaviour.

pub mod caller;
pub mod callbacks;
pub mod cif;
pub mod loader;
pub mod marshal;
pub mod types;

pub use caller::{invoke, CallError, ExternFunction};
pub use callbacks::{create_callback, Callback, CallbackError};
pub use cif::{Abi, Cif, PrepareError};
pub use loader::{Library, LibraryLoader, LoadError, OpenFlags};
pub use marshal::{
    marshal_value, read_complex128, read_complex64, read_value, unmarshal_arg, unmarshal_return,
    ArgFrame, MarshalError, NativeScalar,
};
pub use types::{
    describe, ExternType, FnSignature, HostType, Signature, TypeClass, TypeDescriptor,
    UnsupportedType,
};
