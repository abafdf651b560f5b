//! Host values exchanged with native code
//!
//! `Value` is what callers pass to and receive from bound functions and data
//! symbols. `RawAddress` is an opaque native address: the runtime reads
//! through it or calls through it, but never owns what it points to.

use std::ffi::c_void;
use std::fmt;

/// Opaque address in the process (symbol, buffer, C string...)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawAddress(*mut c_void);

// Safety: a RawAddress is only a number; every dereference or call through it
// goes through an `unsafe` API whose caller vouches for the target.
unsafe impl Send for RawAddress {}
unsafe impl Sync for RawAddress {}

impl RawAddress {
    /// The null address
    pub const NULL: RawAddress = RawAddress(std::ptr::null_mut());

    pub fn new(ptr: *mut c_void) -> Self {
        RawAddress(ptr)
    }

    /// Address of any pointer, dropping its type
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        RawAddress(ptr as *mut c_void)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Numeric value of the address
    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawAddress({:#x})", self.addr())
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// A host value crossing the FFI boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value (void return)
    Void,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    ISize(isize),
    USize(usize),
    F32(f32),
    F64(f64),
    /// `float _Complex` as `[re, im]`
    Complex64([f32; 2]),
    /// `double _Complex` as `[re, im]`
    Complex128([f64; 2]),
    /// Raw native address
    Pointer(RawAddress),
    /// Text; passed to native code as a NUL-terminated copy
    String(String),
}

impl Value {
    /// Get a display name for the kind of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::ISize(_) => "isize",
            Value::USize(_) => "usize",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Complex64(_) => "complex64",
            Value::Complex128(_) => "complex128",
            Value::Pointer(_) => "pointer",
            Value::String(_) => "string",
        }
    }

    /// Build a string value
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Integer payload as raw two's-complement bits plus signedness
    ///
    /// Used by the marshaler to narrow or widen between integer widths.
    pub(crate) fn integer_bits(&self) -> Option<(u64, bool)> {
        match *self {
            Value::I8(v) => Some((v as i64 as u64, true)),
            Value::I16(v) => Some((v as i64 as u64, true)),
            Value::I32(v) => Some((v as i64 as u64, true)),
            Value::I64(v) => Some((v as u64, true)),
            Value::ISize(v) => Some((v as i64 as u64, true)),
            Value::U8(v) => Some((v as u64, false)),
            Value::U16(v) => Some((v as u64, false)),
            Value::U32(v) => Some((v as u64, false)),
            Value::U64(v) => Some((v, false)),
            Value::USize(v) => Some((v as u64, false)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            Value::F32(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.integer_bits().map(|(bits, _)| bits as i64)
    }

    pub fn as_pointer(&self) -> Option<RawAddress> {
        match *self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    isize => ISize,
    usize => USize,
    f32 => F32,
    f64 => F64,
    RawAddress => Pointer,
    String => String,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
