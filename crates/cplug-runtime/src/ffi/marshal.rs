//! Value marshaling between host values and native slots
//!
//! Arguments are converted into `NativeScalar` slots held by an `ArgFrame`,
//! which also owns any C strings created for them. Return slots and data
//! symbols are read back into `Value`s.
//!
//! # Conversion rules
//!
//! - integer to integer: narrowing truncates (two's complement), widening
//!   sign- or zero-extends according to the source value
//! - `f64` to `f32` rounds, `f32` to `f64` is exact
//! - integer to float and float to integer are rejected
//! - strings become NUL-terminated copies owned by the frame
//! - `void` is never a valid argument

use crate::ffi::types::{ExternType, TypeClass};
use crate::value::{RawAddress, Value};
use smallvec::SmallVec;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::mem::size_of;
use thiserror::Error;

/// Marshal error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("null pointer where {0} was expected")]
    NullPointer(&'static str),

    #[error("invalid string: {0}")]
    InvalidString(String),
}

impl MarshalError {
    fn mismatch(expected: impl fmt::Display, got: &Value) -> Self {
        MarshalError::TypeMismatch {
            expected: expected.to_string(),
            got: got.type_name().to_string(),
        }
    }
}

/// Storage for one native scalar
///
/// Large and aligned enough for every supported kind, and for the full
/// register word libffi writes for narrow integer returns.
#[repr(C)]
#[derive(Clone, Copy)]
pub union NativeScalar {
    pub i8: i8,
    pub u8: u8,
    pub i16: i16,
    pub u16: u16,
    pub i32: i32,
    pub u32: u32,
    pub i64: i64,
    pub u64: u64,
    pub isize: isize,
    pub usize: usize,
    pub f32: f32,
    pub f64: f64,
    pub ptr: *mut c_void,
}

impl NativeScalar {
    /// All bits zero
    pub fn zeroed() -> Self {
        NativeScalar { u64: 0 }
    }

    /// Pointer to the start of the storage
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self as *mut NativeScalar as *mut c_void
    }

    fn from_int(bits: u64, ty: ExternType) -> Self {
        let mut s = NativeScalar::zeroed();
        match (ty.size(), ty.class()) {
            (1, TypeClass::Signed) => s.i8 = bits as i8,
            (1, _) => s.u8 = bits as u8,
            (2, TypeClass::Signed) => s.i16 = bits as i16,
            (2, _) => s.u16 = bits as u16,
            (4, TypeClass::Signed) => s.i32 = bits as i32,
            (4, _) => s.u32 = bits as u32,
            _ => s.u64 = bits,
        }
        s
    }
}

impl Default for NativeScalar {
    fn default() -> Self {
        NativeScalar::zeroed()
    }
}

impl fmt::Debug for NativeScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Every bit pattern is a valid u64.
        write!(f, "NativeScalar({:#018x})", unsafe { self.u64 })
    }
}

/// Marshal one value into a native slot
///
/// C strings created for `char*` (or `void*`) targets are pushed onto
/// `strings`; the returned slot points into them, so they must outlive the
/// call.
pub fn marshal_value(
    value: &Value,
    ty: ExternType,
    strings: &mut Vec<CString>,
) -> Result<NativeScalar, MarshalError> {
    let mut slot = NativeScalar::zeroed();

    match ty.class() {
        TypeClass::Void => return Err(MarshalError::mismatch("a non-void argument", value)),

        TypeClass::Signed | TypeClass::Unsigned => {
            let (bits, _) = value
                .integer_bits()
                .ok_or_else(|| MarshalError::mismatch(ty, value))?;
            slot = NativeScalar::from_int(bits, ty);
        }

        TypeClass::Float => match (ty, value) {
            (ExternType::F32, Value::F32(v)) => slot.f32 = *v,
            (ExternType::F32, Value::F64(v)) => slot.f32 = *v as f32,
            (ExternType::F64, Value::F64(v)) => slot.f64 = *v,
            (ExternType::F64, Value::F32(v)) => slot.f64 = *v as f64,
            _ => return Err(MarshalError::mismatch(ty, value)),
        },

        TypeClass::Pointer => match value {
            Value::Pointer(p) => slot.ptr = p.as_ptr(),
            Value::String(s) => {
                let c_string = CString::new(s.as_str()).map_err(|e| {
                    MarshalError::InvalidString(format!("string contains NUL byte: {}", e))
                })?;
                slot.ptr = c_string.as_ptr() as *mut c_void;
                strings.push(c_string);
            }
            // An integer is accepted as an address for `void*` only
            other if ty == ExternType::Pointer => {
                let (bits, _) = other
                    .integer_bits()
                    .ok_or_else(|| MarshalError::mismatch(ty, value))?;
                slot.ptr = bits as usize as *mut c_void;
            }
            _ => return Err(MarshalError::mismatch(ty, value)),
        },
    }

    Ok(slot)
}

/// Per-call argument storage
///
/// Owns one slot per argument plus the C strings those slots point to.
/// Everything is released when the frame is dropped.
pub struct ArgFrame {
    storage: SmallVec<[NativeScalar; 8]>,
    strings: Vec<CString>,
}

impl ArgFrame {
    /// Marshal `values` against the parameter kinds `types`
    pub fn marshal(values: &[Value], types: &[ExternType]) -> Result<Self, MarshalError> {
        if values.len() != types.len() {
            return Err(MarshalError::TypeMismatch {
                expected: format!("{} arguments", types.len()),
                got: format!("{} arguments", values.len()),
            });
        }

        let mut strings = Vec::new();
        let storage = values
            .iter()
            .zip(types)
            .map(|(value, ty)| marshal_value(value, *ty, &mut strings))
            .collect::<Result<SmallVec<[NativeScalar; 8]>, _>>()?;

        Ok(Self { storage, strings })
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Ordered slot pointers for libffi
    ///
    /// The pointers are only valid while the frame is alive and not moved.
    pub fn slots(&mut self) -> SmallVec<[*mut c_void; 8]> {
        self.storage.iter_mut().map(|s| s.as_mut_ptr()).collect()
    }

    /// Slot contents, in argument order
    pub fn values(&self) -> &[NativeScalar] {
        &self.storage
    }
}

impl fmt::Debug for ArgFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgFrame")
            .field("storage", &self.storage)
            .field("strings", &self.strings.len())
            .finish()
    }
}

fn int_value(bits: u64, ty: ExternType) -> Value {
    match ty {
        ExternType::ISize => Value::ISize(bits as isize),
        ExternType::USize => Value::USize(bits as usize),
        _ => match (ty.size(), ty.class()) {
            (1, TypeClass::Signed) => Value::I8(bits as i8),
            (1, _) => Value::U8(bits as u8),
            (2, TypeClass::Signed) => Value::I16(bits as i16),
            (2, _) => Value::U16(bits as u16),
            (4, TypeClass::Signed) => Value::I32(bits as i32),
            (4, _) => Value::U32(bits as u32),
            (_, TypeClass::Signed) => Value::I64(bits as i64),
            _ => Value::U64(bits),
        },
    }
}

unsafe fn c_string_value(ptr: *const c_char) -> Result<Value, MarshalError> {
    if ptr.is_null() {
        return Err(MarshalError::NullPointer("char*"));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| Value::String(s.to_string()))
        .map_err(|e| MarshalError::InvalidString(format!("invalid UTF-8: {}", e)))
}

/// Convert a filled return slot into a value
///
/// libffi widens integer returns narrower than a register to a full word,
/// so integers are read from the whole word and then truncated.
///
/// # Safety
///
/// For `char*` returns the slot must hold null or a valid C string.
pub unsafe fn unmarshal_return(slot: &NativeScalar, ty: ExternType) -> Result<Value, MarshalError> {
    match ty.class() {
        TypeClass::Void => Ok(Value::Void),
        TypeClass::Signed | TypeClass::Unsigned => {
            let bits = if ty.size() <= size_of::<usize>() {
                slot.usize as u64
            } else {
                slot.u64
            };
            Ok(int_value(bits, ty))
        }
        TypeClass::Float if ty == ExternType::F32 => Ok(Value::F32(slot.f32)),
        TypeClass::Float => Ok(Value::F64(slot.f64)),
        TypeClass::Pointer if ty == ExternType::CharPtr => c_string_value(slot.ptr as *const c_char),
        TypeClass::Pointer => Ok(Value::Pointer(RawAddress::new(slot.ptr))),
    }
}

/// Read a value of kind `ty` stored at `ptr` in native layout
unsafe fn read_native(ptr: *const c_void, ty: ExternType) -> Result<Value, MarshalError> {
    if ptr.is_null() {
        return Err(MarshalError::NullPointer("a data address"));
    }

    let value = match ty.class() {
        TypeClass::Void => Value::Void,
        TypeClass::Signed | TypeClass::Unsigned => {
            let bits = match (ty.size(), ty.class()) {
                (1, TypeClass::Signed) => (ptr as *const i8).read_unaligned() as i64 as u64,
                (1, _) => (ptr as *const u8).read_unaligned() as u64,
                (2, TypeClass::Signed) => (ptr as *const i16).read_unaligned() as i64 as u64,
                (2, _) => (ptr as *const u16).read_unaligned() as u64,
                (4, TypeClass::Signed) => (ptr as *const i32).read_unaligned() as i64 as u64,
                (4, _) => (ptr as *const u32).read_unaligned() as u64,
                _ => (ptr as *const u64).read_unaligned(),
            };
            int_value(bits, ty)
        }
        TypeClass::Float if ty == ExternType::F32 => {
            Value::F32((ptr as *const f32).read_unaligned())
        }
        TypeClass::Float => Value::F64((ptr as *const f64).read_unaligned()),
        TypeClass::Pointer => {
            let p = (ptr as *const *mut c_void).read_unaligned();
            if ty == ExternType::CharPtr {
                return c_string_value(p as *const c_char);
            }
            Value::Pointer(RawAddress::new(p))
        }
    };

    Ok(value)
}

/// Read a data symbol
///
/// # Safety
///
/// `addr` must point to a readable value of kind `ty`; for `char*` the
/// pointer stored there must be null or a valid C string.
pub unsafe fn read_value(addr: RawAddress, ty: ExternType) -> Result<Value, MarshalError> {
    read_native(addr.as_ptr(), ty)
}

/// Read a `float _Complex` data symbol
///
/// # Safety
///
/// `addr` must point to two readable `f32`s (real part first).
pub unsafe fn read_complex64(addr: RawAddress) -> Result<Value, MarshalError> {
    if addr.is_null() {
        return Err(MarshalError::NullPointer("a data address"));
    }
    Ok(Value::Complex64((addr.as_ptr() as *const [f32; 2]).read_unaligned()))
}

/// Read a `double _Complex` data symbol
///
/// # Safety
///
/// `addr` must point to two readable `f64`s (real part first).
pub unsafe fn read_complex128(addr: RawAddress) -> Result<Value, MarshalError> {
    if addr.is_null() {
        return Err(MarshalError::NullPointer("a data address"));
    }
    Ok(Value::Complex128((addr.as_ptr() as *const [f64; 2]).read_unaligned()))
}

/// Read one incoming callback argument
///
/// # Safety
///
/// `arg` must be the argument pointer libffi handed to a closure whose
/// corresponding parameter has kind `ty`.
pub unsafe fn unmarshal_arg(arg: *const c_void, ty: ExternType) -> Result<Value, MarshalError> {
    read_native(arg, ty)
}
