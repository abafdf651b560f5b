//! Callbacks: host closures exposed as C function pointers
//!
//! A `Callback` wraps a Rust closure in a libffi closure so native code can
//! call it through an ordinary function pointer (a `qsort` comparator, an
//! event hook...). Incoming arguments are unmarshaled into `Value`s and the
//! closure's result is written back into the native return slot.
//!
//! Failures never unwind into native code: errors, panics, and results of the
//! wrong kind are logged and the callback returns zero.

use crate::ffi::cif::{Abi, Cif, PrepareError};
use crate::ffi::marshal::{unmarshal_arg, MarshalError, NativeScalar};
use crate::ffi::types::{ExternType, FnSignature, TypeClass};
use crate::value::{RawAddress, Value};
use libffi::low::{self, ffi_cif};
use libffi::raw::ffi_closure;
use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Callback errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("unsupported callback signature: {0}")]
    UnsupportedSignature(String),

    #[error("failed to allocate native closure")]
    AllocationFailed,

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("callback returned {got}, expected {expected}")]
    ResultMismatch { expected: String, got: String },

    /// Error raised by the host closure itself
    #[error("callback failed: {0}")]
    Failed(String),
}

type Handler = dyn Fn(&[Value]) -> Result<Value, CallbackError> + Send + Sync;

struct CallbackData {
    handler: Box<Handler>,
    signature: FnSignature,
}

impl CallbackData {
    unsafe fn run(&self, args: *const *const c_void) -> Result<Value, CallbackError> {
        let values = self
            .signature
            .params()
            .iter()
            .enumerate()
            .map(|(i, ty)| unmarshal_arg(*args.add(i), *ty))
            .collect::<Result<Vec<_>, _>>()?;
        (self.handler)(&values)
    }
}

/// A host closure callable from native code
///
/// The function pointer returned by `code_ptr` is valid until the
/// `Callback` is dropped.
pub struct Callback {
    closure: *mut ffi_closure,
    code: RawAddress,
    // Both are referenced by the native closure and must outlive it.
    cif: Cif,
    data: Box<CallbackData>,
}

// Safety: the handler is Send + Sync, and the closure and cif are never
// mutated after preparation.
unsafe impl Send for Callback {}
unsafe impl Sync for Callback {}

impl Callback {
    /// Native entry point for this callback
    pub fn code_ptr(&self) -> RawAddress {
        self.code
    }

    pub fn signature(&self) -> &FnSignature {
        &self.data.signature
    }

    /// The call interface the closure was prepared with
    pub fn cif(&self) -> &Cif {
        &self.cif
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        // Safety: allocated by closure_alloc in `create_callback` and freed
        // exactly once, before the cif and data it points to.
        unsafe { low::closure_free(self.closure) };
        tracing::trace!(code = %self.code, "freed callback");
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("code", &self.code)
            .field("signature", &self.data.signature.to_string())
            .finish()
    }
}

/// Create a C-callable function pointer for a host closure
///
/// `char*` results are rejected: the callback has nowhere to keep a string
/// alive after returning it.
pub fn create_callback<F>(
    handler: F,
    params: Vec<ExternType>,
    ret: ExternType,
) -> Result<Callback, CallbackError>
where
    F: Fn(&[Value]) -> Result<Value, CallbackError> + Send + Sync + 'static,
{
    if ret == ExternType::CharPtr {
        return Err(CallbackError::UnsupportedSignature(
            "char* results are not supported".to_string(),
        ));
    }
    let signature = FnSignature::new(params, ret)
        .map_err(|e| CallbackError::UnsupportedSignature(e.to_string()))?;

    let cif = Cif::for_signature(&signature)?;
    let data = Box::new(CallbackData {
        handler: Box::new(handler),
        signature,
    });

    let (closure, code) = low::closure_alloc();
    if closure.is_null() {
        return Err(CallbackError::AllocationFailed);
    }

    let status = unsafe {
        low::prep_closure(
            closure,
            cif.as_raw_ptr(),
            dispatch,
            &*data as *const CallbackData,
            code,
        )
    };

    if let Err(e) = status {
        unsafe { low::closure_free(closure) };
        return Err(match e {
            low::Error::Abi => {
                CallbackError::Prepare(PrepareError::BadAbi(Abi::DEFAULT.as_raw() as u64))
            }
            _ => CallbackError::Prepare(PrepareError::BadTypedef),
        });
    }

    let code = RawAddress::new(code.as_ptr() as *mut c_void);
    tracing::debug!(%code, signature = %data.signature, "created callback");

    Ok(Callback {
        closure,
        code,
        cif,
        data,
    })
}

extern "C" fn dispatch(
    _cif: &ffi_cif,
    result: &mut NativeScalar,
    args: *const *const c_void,
    data: &CallbackData,
) {
    let ret = data.signature.ret();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { data.run(args) }));

    let written = match outcome {
        Ok(Ok(value)) => write_return(result, &value, ret),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::error!(signature = %data.signature, "callback panicked");
            write_zero(result, ret);
            return;
        }
    };

    if let Err(e) = written {
        tracing::warn!(signature = %data.signature, error = %e, "callback failed");
        write_zero(result, ret);
    }
}

/// Write a callback result into libffi's return buffer
///
/// Integers narrower than a register are widened to a full word, as libffi
/// expects for closure returns.
fn write_return(
    result: &mut NativeScalar,
    value: &Value,
    ret: ExternType,
) -> Result<(), CallbackError> {
    let mismatch = || CallbackError::ResultMismatch {
        expected: ret.to_string(),
        got: value.type_name().to_string(),
    };

    match ret.class() {
        TypeClass::Void => {}
        TypeClass::Signed | TypeClass::Unsigned => {
            let (bits, _) = value.integer_bits().ok_or_else(mismatch)?;
            let word = match (ret.size(), ret.class()) {
                (1, TypeClass::Signed) => bits as i8 as i64 as u64,
                (1, _) => bits as u8 as u64,
                (2, TypeClass::Signed) => bits as i16 as i64 as u64,
                (2, _) => bits as u16 as u64,
                (4, TypeClass::Signed) => bits as i32 as i64 as u64,
                (4, _) => bits as u32 as u64,
                _ => bits,
            };
            if ret.size() <= size_of::<usize>() {
                result.usize = word as usize;
            } else {
                result.u64 = word;
            }
        }
        TypeClass::Float => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            if ret == ExternType::F32 {
                result.f32 = v as f32;
            } else {
                result.f64 = v;
            }
        }
        TypeClass::Pointer => {
            result.ptr = value.as_pointer().ok_or_else(mismatch)?.as_ptr();
        }
    }
    Ok(())
}

fn write_zero(result: &mut NativeScalar, ret: ExternType) {
    match ret.class() {
        TypeClass::Void => {}
        TypeClass::Signed | TypeClass::Unsigned if ret.size() > size_of::<usize>() => {
            result.u64 = 0
        }
        TypeClass::Signed | TypeClass::Unsigned => result.usize = 0,
        TypeClass::Float if ret == ExternType::F32 => result.f32 = 0.0,
        TypeClass::Float => result.f64 = 0.0,
        TypeClass::Pointer => result.ptr = std::ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::caller::ExternFunction;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn bind(cb: &Callback) -> ExternFunction {
        unsafe { ExternFunction::new(cb.code_ptr(), cb.signature().clone(), None) }.unwrap()
    }

    #[test]
    fn test_int_callback_roundtrip() {
        let cb = create_callback(
            |args| match args {
                [Value::I32(a), Value::I32(b)] => Ok(Value::I32(a + b)),
                _ => Err(CallbackError::Failed("bad arguments".to_string())),
            },
            vec![ExternType::I32, ExternType::I32],
            ExternType::I32,
        )
        .unwrap();

        let f = bind(&cb);
        assert_eq!(f.call(&[Value::I32(2), Value::I32(3)]), Ok(Value::I32(5)));
        assert!(!cb.code_ptr().is_null());
    }

    #[test]
    fn test_double_callback() {
        let cb = create_callback(
            |args| Ok(Value::F64(args[0].as_f64().unwrap_or(0.0) * 2.0)),
            vec![ExternType::F64],
            ExternType::F64,
        )
        .unwrap();

        assert_eq!(bind(&cb).call(&[Value::F64(1.25)]), Ok(Value::F64(2.5)));
    }

    #[test]
    fn test_narrow_result_widened() {
        let cb = create_callback(|_| Ok(Value::I32(-3)), vec![], ExternType::Short).unwrap();
        assert_eq!(bind(&cb).call(&[]), Ok(Value::I16(-3)));
    }

    #[test]
    fn test_void_callback_side_effect() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let cb = create_callback(
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Void)
            },
            vec![ExternType::Pointer],
            ExternType::Void,
        )
        .unwrap();

        let f = bind(&cb);
        f.call(&[Value::Pointer(RawAddress::NULL)]).unwrap();
        f.call(&[Value::Pointer(RawAddress::NULL)]).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_returns_zero() {
        let cb = create_callback(
            |_| Err(CallbackError::Failed("nope".to_string())),
            vec![],
            ExternType::I64,
        )
        .unwrap();
        assert_eq!(bind(&cb).call(&[]), Ok(Value::I64(0)));
    }

    #[test]
    fn test_mismatched_result_returns_zero() {
        let cb = create_callback(|_| Ok(Value::string("x")), vec![], ExternType::F64).unwrap();
        assert_eq!(bind(&cb).call(&[]), Ok(Value::F64(0.0)));
    }

    #[test]
    fn test_panic_does_not_unwind_into_native() {
        let cb = create_callback(|_| panic!("boom"), vec![ExternType::I32], ExternType::I32)
            .unwrap();
        assert_eq!(bind(&cb).call(&[Value::I32(1)]), Ok(Value::I32(0)));
    }

    #[test]
    fn test_char_ptr_result_rejected() {
        let result = create_callback(|_| Ok(Value::Void), vec![], ExternType::CharPtr);
        assert!(matches!(result, Err(CallbackError::UnsupportedSignature(_))));
    }

    #[test]
    fn test_void_param_rejected() {
        let result = create_callback(|_| Ok(Value::Void), vec![ExternType::Void], ExternType::Void);
        assert!(matches!(result, Err(CallbackError::UnsupportedSignature(_))));
    }
}
