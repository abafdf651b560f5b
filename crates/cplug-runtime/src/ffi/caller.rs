//! Invoking native functions through a prepared call interface
//!
//! `invoke` is the single point where control enters native code. Bound
//! functions (`ExternFunction`) wrap a CIF, a code address, and the library
//! handle they came from, and run the marshal, invoke, unmarshal cycle for
//! each call.

use crate::ffi::cif::{Cif, PrepareError};
use crate::ffi::loader::Library;
use crate::ffi::marshal::{unmarshal_return, ArgFrame, MarshalError, NativeScalar};
use crate::ffi::types::{ExternType, FnSignature};
use crate::value::{RawAddress, Value};
use libffi::low::CodePtr;
use libffi::raw::ffi_call;
use std::ffi::c_void;
use std::fmt;
use thiserror::Error;

/// FFI call errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("non-void call without a return slot")]
    MissingReturnSlot,

    #[error("call through a null function address")]
    NullFunction,

    #[error("library '{0}' has been closed")]
    HandleClosed(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Call `code` through `cif`
///
/// `args` holds one pointer per argument, each pointing at storage of the
/// matching type; `ret` points at storage for the return value and may be
/// null only when the return type is void. Only the argument count, the
/// return slot, and a null code address are checked.
///
/// # Safety
///
/// `code` must be a function whose real signature matches `cif`, and every
/// slot must point to valid storage of its declared type. A native fault is
/// not recoverable.
pub unsafe fn invoke(
    cif: &Cif,
    code: RawAddress,
    ret: *mut c_void,
    args: &mut [*mut c_void],
) -> Result<(), CallError> {
    if args.len() != cif.arity() {
        return Err(CallError::ArityMismatch {
            expected: cif.arity(),
            got: args.len(),
        });
    }
    if ret.is_null() && cif.return_type().kind() != ExternType::Void {
        return Err(CallError::MissingReturnSlot);
    }
    if code.is_null() {
        return Err(CallError::NullFunction);
    }

    let code = CodePtr::from_ptr(code.as_ptr());
    ffi_call(cif.as_raw_ptr(), Some(*code.as_fun()), ret, args.as_mut_ptr());
    Ok(())
}

/// A native function bound to a signature
///
/// Holds the prepared CIF for the lifetime of the binding. Calls take a
/// shared lock on the owning library, so the library cannot be closed while
/// a call is running and calls after `close` fail with `HandleClosed`.
pub struct ExternFunction {
    cif: Cif,
    code: RawAddress,
    signature: FnSignature,
    library: Option<Library>,
}

impl ExternFunction {
    /// Bind a code address to a signature
    ///
    /// `library` is the handle the address was resolved from; pass `None`
    /// for code that is not owned by a loaded library (for example a
    /// callback or a function of the host itself).
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `code` points to a function whose real signature matches `signature`
    /// - the code stays valid while this binding exists (or until `library`
    ///   is closed)
    pub unsafe fn new(
        code: RawAddress,
        signature: FnSignature,
        library: Option<Library>,
    ) -> Result<Self, PrepareError> {
        let cif = Cif::for_signature(&signature)?;
        Ok(Self {
            cif,
            code,
            signature,
            library,
        })
    }

    /// Call the function with host values
    pub fn call(&self, args: &[Value]) -> Result<Value, CallError> {
        let _live = match &self.library {
            Some(lib) => Some(
                lib.live()
                    .ok_or_else(|| CallError::HandleClosed(lib.name().to_string()))?,
            ),
            None => None,
        };

        if args.len() != self.signature.arity() {
            return Err(CallError::ArityMismatch {
                expected: self.signature.arity(),
                got: args.len(),
            });
        }

        let mut frame = ArgFrame::marshal(args, self.signature.params())?;
        let mut slots = frame.slots();

        let ret_ty = self.signature.ret();
        let mut ret = NativeScalar::zeroed();
        let ret_ptr = if ret_ty == ExternType::Void {
            std::ptr::null_mut()
        } else {
            ret.as_mut_ptr()
        };

        tracing::trace!(code = %self.code, signature = %self.signature, "invoking native function");

        // Safety: `new` guarantees the code matches the signature, and the
        // frame and return slot outlive the call.
        unsafe { invoke(&self.cif, self.code, ret_ptr, &mut slots)? };

        if ret_ty == ExternType::Void {
            return Ok(Value::Void);
        }
        // Safety: the slot was just filled by a function returning `ret_ty`.
        Ok(unsafe { unmarshal_return(&ret, ret_ty) }?)
    }

    pub fn signature(&self) -> &FnSignature {
        &self.signature
    }

    /// Address of the bound code
    pub fn code(&self) -> RawAddress {
        self.code
    }

    pub fn arity(&self) -> usize {
        self.signature.arity()
    }

    pub fn cif(&self) -> &Cif {
        &self.cif
    }
}

impl fmt::Debug for ExternFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternFunction")
            .field("code", &self.code)
            .field("signature", &self.signature.to_string())
            .field("library", &self.library.as_ref().map(|l| l.name()))
            .finish()
    }
}
