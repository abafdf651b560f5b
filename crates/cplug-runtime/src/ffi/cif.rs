//! Call interfaces
//!
//! A `Cif` is libffi's prepared description of one function signature: the
//! calling convention plus the argument and return layouts. It is built once
//! per signature and then used, read-only, for any number of calls.

use crate::ffi::types::{describe, ExternType, FnSignature, TypeDescriptor};
use libffi::low::{self, ffi_cif, ffi_type};
use libffi::raw::{ffi_abi, ffi_abi_FFI_DEFAULT_ABI};
use std::ffi::c_uint;
use std::fmt;
use thiserror::Error;

/// Errors while preparing a call interface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrepareError {
    #[error("invalid type definition in signature")]
    BadTypedef,

    #[error("unsupported calling convention ({0})")]
    BadAbi(u64),

    #[error("too many arguments ({0})")]
    ArityOverflow(usize),
}

/// Calling convention identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abi(ffi_abi);

impl Abi {
    /// The platform's default C calling convention
    pub const DEFAULT: Abi = Abi(ffi_abi_FFI_DEFAULT_ABI);

    /// Wrap a raw libffi ABI number
    ///
    /// The value is not checked here; an invalid ABI is reported by
    /// `Cif::with_abi`.
    pub fn from_raw(raw: ffi_abi) -> Self {
        Abi(raw)
    }

    pub fn as_raw(self) -> ffi_abi {
        self.0
    }
}

impl Default for Abi {
    fn default() -> Self {
        Abi::DEFAULT
    }
}

/// A prepared call interface
///
/// Owns the libffi `ffi_cif` and the argument type array it points into.
/// The prepared state is never written after preparation, so a `Cif` can be
/// shared between threads and used for concurrent calls.
pub struct Cif {
    // Declared before `arg_types` so it is dropped first.
    raw: Box<ffi_cif>,
    arg_types: Box<[*mut ffi_type]>,
    ret: &'static TypeDescriptor,
    args: Box<[&'static TypeDescriptor]>,
}

// Safety: after `prep_cif` neither the cif nor the type array is mutated, and
// the descriptors are immutable statics.
unsafe impl Send for Cif {}
unsafe impl Sync for Cif {}

impl Cif {
    /// Prepare a call interface with the default ABI
    pub fn new(
        ret: &'static TypeDescriptor,
        args: &[&'static TypeDescriptor],
    ) -> Result<Self, PrepareError> {
        Self::with_abi(Abi::DEFAULT, ret, args)
    }

    /// Prepare a call interface for an explicit ABI
    pub fn with_abi(
        abi: Abi,
        ret: &'static TypeDescriptor,
        args: &[&'static TypeDescriptor],
    ) -> Result<Self, PrepareError> {
        if args.len() > c_uint::MAX as usize {
            return Err(PrepareError::ArityOverflow(args.len()));
        }
        if args.iter().any(|a| a.kind() == ExternType::Void) {
            return Err(PrepareError::BadTypedef);
        }

        let arg_types: Box<[*mut ffi_type]> = args.iter().map(|a| a.raw()).collect();
        let mut cif = Cif {
            raw: Box::new(ffi_cif::default()),
            arg_types,
            ret,
            args: args.into(),
        };

        let status = unsafe {
            low::prep_cif(
                &mut *cif.raw,
                abi.as_raw(),
                cif.arg_types.len(),
                ret.raw(),
                cif.arg_types.as_mut_ptr(),
            )
        };

        match status {
            Ok(()) => {
                tracing::trace!(
                    ret = ret.name(),
                    arity = args.len(),
                    "prepared call interface"
                );
                Ok(cif)
            }
            Err(low::Error::Abi) => Err(PrepareError::BadAbi(abi.as_raw() as u64)),
            Err(_) => Err(PrepareError::BadTypedef),
        }
    }

    /// Prepare a call interface for a validated signature
    pub fn for_signature(sig: &FnSignature) -> Result<Self, PrepareError> {
        let args: Vec<&'static TypeDescriptor> =
            sig.params().iter().map(|p| describe(*p)).collect();
        Self::new(describe(sig.ret()), &args)
    }

    /// Number of fixed arguments
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn return_type(&self) -> &'static TypeDescriptor {
        self.ret
    }

    pub fn arg_types(&self) -> &[&'static TypeDescriptor] {
        &self.args
    }

    /// Release the call interface
    ///
    /// Equivalent to dropping it.
    pub fn release(self) {
        tracing::trace!(arity = self.arity(), "released call interface");
    }

    /// Raw pointer for libffi entry points
    ///
    /// libffi only reads through it.
    pub fn as_raw_ptr(&self) -> *mut ffi_cif {
        &*self.raw as *const ffi_cif as *mut ffi_cif
    }
}

impl fmt::Debug for Cif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<&str> = self.args.iter().map(|a| a.name()).collect();
        f.debug_struct("Cif")
            .field("args", &args)
            .field("ret", &self.ret.name())
            .finish()
    }
}
