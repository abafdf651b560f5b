//! Type descriptors for the FFI boundary
//!
//! `ExternType` is the closed set of C scalar kinds the call engine supports.
//! Each kind has exactly one static `TypeDescriptor` carrying its native size,
//! alignment, classification and the libffi type it is prepared against.
//!
//! `HostType` is the open vocabulary callers use to describe what they expect
//! a symbol to be. It can name kinds the engine cannot call with (bool,
//! complex numbers, aggregates, variadic functions) so that rejecting them is
//! an explicit, observable step.

use libffi::low::{ffi_type, types};
use std::ffi::{c_char, c_int, c_long, c_schar, c_short, c_uchar, c_uint, c_ulong, c_ushort};
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::addr_of_mut;
use thiserror::Error;

/// C scalar kinds supported by the call engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternType {
    /// No value (only valid as a return type)
    Void,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Untyped pointer (void*)
    Pointer,
    /// NUL-terminated C string (char*)
    CharPtr,
    /// signed char
    SChar,
    /// unsigned char
    UChar,
    /// short
    Short,
    /// unsigned short
    UShort,
    /// int
    Int,
    /// unsigned int
    UInt,
    /// long (32 or 64 bits depending on the platform)
    Long,
    /// unsigned long
    ULong,
    /// ssize_t / isize
    ISize,
    /// size_t / usize
    USize,
}

impl ExternType {
    /// Every supported kind
    pub const ALL: [ExternType; 23] = [
        ExternType::Void,
        ExternType::U8,
        ExternType::U16,
        ExternType::U32,
        ExternType::U64,
        ExternType::I8,
        ExternType::I16,
        ExternType::I32,
        ExternType::I64,
        ExternType::F32,
        ExternType::F64,
        ExternType::Pointer,
        ExternType::CharPtr,
        ExternType::SChar,
        ExternType::UChar,
        ExternType::Short,
        ExternType::UShort,
        ExternType::Int,
        ExternType::UInt,
        ExternType::Long,
        ExternType::ULong,
        ExternType::ISize,
        ExternType::USize,
    ];

    /// Get the static descriptor for this kind
    pub fn descriptor(self) -> &'static TypeDescriptor {
        describe(self)
    }

    /// C-style name of this kind
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn class(self) -> TypeClass {
        self.descriptor().class
    }

    pub fn size(self) -> usize {
        self.descriptor().size
    }

    pub fn is_integer(self) -> bool {
        matches!(self.class(), TypeClass::Signed | TypeClass::Unsigned)
    }

    /// Map a host type onto a supported kind
    ///
    /// Returns `None` for kinds the engine cannot pass by value.
    pub fn from_host(host: &HostType) -> Option<ExternType> {
        let ty = match host {
            HostType::Void => ExternType::Void,
            HostType::U8 => ExternType::U8,
            HostType::U16 => ExternType::U16,
            HostType::U32 => ExternType::U32,
            HostType::U64 => ExternType::U64,
            HostType::I8 => ExternType::I8,
            HostType::I16 => ExternType::I16,
            HostType::I32 => ExternType::I32,
            HostType::I64 => ExternType::I64,
            HostType::ISize => ExternType::ISize,
            HostType::USize => ExternType::USize,
            HostType::F32 => ExternType::F32,
            HostType::F64 => ExternType::F64,
            HostType::Pointer => ExternType::Pointer,
            HostType::String => ExternType::CharPtr,
            HostType::C(c) => *c,
            HostType::Bool
            | HostType::Complex64
            | HostType::Complex128
            | HostType::Struct(_)
            | HostType::Array(_, _)
            | HostType::Function(_) => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for ExternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Broad classification of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Void,
    Signed,
    Unsigned,
    Float,
    Pointer,
}

/// libffi base type a descriptor is prepared against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbiType {
    Void,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    Float,
    Double,
    Pointer,
}

const fn signed_abi(size: usize) -> AbiType {
    match size {
        1 => AbiType::S8,
        2 => AbiType::S16,
        4 => AbiType::S32,
        _ => AbiType::S64,
    }
}

const fn unsigned_abi(size: usize) -> AbiType {
    match size {
        1 => AbiType::U8,
        2 => AbiType::U16,
        4 => AbiType::U32,
        _ => AbiType::U64,
    }
}

/// Static description of one supported kind
///
/// There is exactly one descriptor per `ExternType`, so descriptors compare
/// by identity.
#[derive(Debug)]
pub struct TypeDescriptor {
    kind: ExternType,
    name: &'static str,
    size: usize,
    align: usize,
    class: TypeClass,
    abi: AbiType,
}

impl TypeDescriptor {
    pub fn kind(&self) -> ExternType {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn class(&self) -> TypeClass {
        self.class
    }

    /// The libffi type this descriptor is prepared against
    ///
    /// libffi takes `*mut ffi_type` but never writes to the scalar base types.
    // Taking the address of an extern static needs `unsafe` before Rust 1.82.
    #[allow(unused_unsafe)]
    pub fn raw(&self) -> *mut ffi_type {
        unsafe {
            match self.abi {
                AbiType::Void => addr_of_mut!(types::void),
                AbiType::U8 => addr_of_mut!(types::uint8),
                AbiType::S8 => addr_of_mut!(types::sint8),
                AbiType::U16 => addr_of_mut!(types::uint16),
                AbiType::S16 => addr_of_mut!(types::sint16),
                AbiType::U32 => addr_of_mut!(types::uint32),
                AbiType::S32 => addr_of_mut!(types::sint32),
                AbiType::U64 => addr_of_mut!(types::uint64),
                AbiType::S64 => addr_of_mut!(types::sint64),
                AbiType::Float => addr_of_mut!(types::float),
                AbiType::Double => addr_of_mut!(types::double),
                AbiType::Pointer => addr_of_mut!(types::pointer),
            }
        }
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for TypeDescriptor {}

macro_rules! descriptors {
    ($($static:ident: $kind:ident, $name:literal, $ty:ty, $class:ident, $abi:expr;)*) => {
        $(
            static $static: TypeDescriptor = TypeDescriptor {
                kind: ExternType::$kind,
                name: $name,
                size: size_of::<$ty>(),
                align: align_of::<$ty>(),
                class: TypeClass::$class,
                abi: $abi,
            };
        )*
    };
}

descriptors! {
    VOID: Void, "void", (), Void, AbiType::Void;
    U8: U8, "uint8_t", u8, Unsigned, AbiType::U8;
    U16: U16, "uint16_t", u16, Unsigned, AbiType::U16;
    U32: U32, "uint32_t", u32, Unsigned, AbiType::U32;
    U64: U64, "uint64_t", u64, Unsigned, AbiType::U64;
    I8: I8, "int8_t", i8, Signed, AbiType::S8;
    I16: I16, "int16_t", i16, Signed, AbiType::S16;
    I32: I32, "int32_t", i32, Signed, AbiType::S32;
    I64: I64, "int64_t", i64, Signed, AbiType::S64;
    F32: F32, "float", f32, Float, AbiType::Float;
    F64: F64, "double", f64, Float, AbiType::Double;
    POINTER: Pointer, "void*", *mut std::ffi::c_void, Pointer, AbiType::Pointer;
    CHAR_PTR: CharPtr, "char*", *const c_char, Pointer, AbiType::Pointer;
    SCHAR: SChar, "signed char", c_schar, Signed, signed_abi(size_of::<c_schar>());
    UCHAR: UChar, "unsigned char", c_uchar, Unsigned, unsigned_abi(size_of::<c_uchar>());
    SHORT: Short, "short", c_short, Signed, signed_abi(size_of::<c_short>());
    USHORT: UShort, "unsigned short", c_ushort, Unsigned, unsigned_abi(size_of::<c_ushort>());
    INT: Int, "int", c_int, Signed, signed_abi(size_of::<c_int>());
    UINT: UInt, "unsigned int", c_uint, Unsigned, unsigned_abi(size_of::<c_uint>());
    LONG: Long, "long", c_long, Signed, signed_abi(size_of::<c_long>());
    ULONG: ULong, "unsigned long", c_ulong, Unsigned, unsigned_abi(size_of::<c_ulong>());
    ISIZE: ISize, "ssize_t", isize, Signed, signed_abi(size_of::<isize>());
    USIZE: USize, "size_t", usize, Unsigned, unsigned_abi(size_of::<usize>());
}

/// Get the static descriptor for a kind
pub fn describe(ty: ExternType) -> &'static TypeDescriptor {
    match ty {
        ExternType::Void => &VOID,
        ExternType::U8 => &U8,
        ExternType::U16 => &U16,
        ExternType::U32 => &U32,
        ExternType::U64 => &U64,
        ExternType::I8 => &I8,
        ExternType::I16 => &I16,
        ExternType::I32 => &I32,
        ExternType::I64 => &I64,
        ExternType::F32 => &F32,
        ExternType::F64 => &F64,
        ExternType::Pointer => &POINTER,
        ExternType::CharPtr => &CHAR_PTR,
        ExternType::SChar => &SCHAR,
        ExternType::UChar => &UCHAR,
        ExternType::Short => &SHORT,
        ExternType::UShort => &USHORT,
        ExternType::Int => &INT,
        ExternType::UInt => &UINT,
        ExternType::Long => &LONG,
        ExternType::ULong => &ULONG,
        ExternType::ISize => &ISIZE,
        ExternType::USize => &USIZE,
    }
}

/// Host-side description of what a symbol is expected to be
#[derive(Debug, Clone, PartialEq)]
pub enum HostType {
    Void,
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    ISize,
    USize,
    F32,
    F64,
    Complex64,
    Complex128,
    /// Raw address
    Pointer,
    /// Text, carried natively as char*
    String,
    /// A platform C type spelled directly
    C(ExternType),
    /// Aggregate with the given field types
    Struct(Vec<HostType>),
    /// Fixed-size array
    Array(Box<HostType>, usize),
    Function(Signature),
}

impl HostType {
    /// Function type with fixed parameters and an optional result
    pub fn function(params: Vec<HostType>, result: Option<HostType>) -> Self {
        HostType::Function(Signature {
            params,
            results: result.into_iter().collect(),
            variadic: false,
        })
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Void => write!(f, "void"),
            HostType::Bool => write!(f, "bool"),
            HostType::U8 => write!(f, "u8"),
            HostType::U16 => write!(f, "u16"),
            HostType::U32 => write!(f, "u32"),
            HostType::U64 => write!(f, "u64"),
            HostType::I8 => write!(f, "i8"),
            HostType::I16 => write!(f, "i16"),
            HostType::I32 => write!(f, "i32"),
            HostType::I64 => write!(f, "i64"),
            HostType::ISize => write!(f, "isize"),
            HostType::USize => write!(f, "usize"),
            HostType::F32 => write!(f, "f32"),
            HostType::F64 => write!(f, "f64"),
            HostType::Complex64 => write!(f, "complex64"),
            HostType::Complex128 => write!(f, "complex128"),
            HostType::Pointer => write!(f, "pointer"),
            HostType::String => write!(f, "string"),
            HostType::C(c) => write!(f, "{}", c),
            HostType::Struct(fields) => {
                write!(f, "struct {{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, " }}")
            }
            HostType::Array(elem, len) => write!(f, "[{}; {}]", elem, len),
            HostType::Function(sig) => write!(f, "{}", sig),
        }
    }
}

/// Host-side function signature
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    pub params: Vec<HostType>,
    pub results: Vec<HostType>,
    pub variadic: bool,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        if self.variadic {
            write!(f, ", ...")?;
        }
        write!(f, ")")?;
        match self.results.as_slice() {
            [] => Ok(()),
            [single] => write!(f, " -> {}", single),
            many => {
                write!(f, " -> (")?;
                for (i, r) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", r)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A host type the engine cannot express
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported type {ty}: {reason}")]
pub struct UnsupportedType {
    pub ty: String,
    pub reason: &'static str,
}

impl UnsupportedType {
    fn new(ty: &impl fmt::Display, reason: &'static str) -> Self {
        Self {
            ty: ty.to_string(),
            reason,
        }
    }
}

/// Validated function signature: supported parameter kinds and one return kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnSignature {
    params: Vec<ExternType>,
    ret: ExternType,
}

impl FnSignature {
    /// Build a signature from supported kinds
    ///
    /// `Void` is only valid as the return kind.
    pub fn new(params: Vec<ExternType>, ret: ExternType) -> Result<Self, UnsupportedType> {
        if let Some(p) = params.iter().find(|p| **p == ExternType::Void) {
            return Err(UnsupportedType::new(p, "void is not a parameter type"));
        }
        Ok(Self { params, ret })
    }

    /// Validate a host signature
    ///
    /// Rejects variadic functions, more than one result, and any parameter
    /// or result that has no `ExternType` equivalent.
    pub fn from_signature(sig: &Signature) -> Result<Self, UnsupportedType> {
        if sig.variadic {
            return Err(UnsupportedType::new(sig, "variadic functions are not supported"));
        }

        let params = sig
            .params
            .iter()
            .map(|p| match ExternType::from_host(p) {
                Some(ExternType::Void) | None => {
                    Err(UnsupportedType::new(p, "parameter has no C equivalent"))
                }
                Some(ty) => Ok(ty),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ret = match sig.results.as_slice() {
            [] => ExternType::Void,
            [result] => ExternType::from_host(result)
                .ok_or_else(|| UnsupportedType::new(result, "result has no C equivalent"))?,
            _ => {
                return Err(UnsupportedType::new(
                    sig,
                    "multiple results are not supported",
                ))
            }
        };

        Ok(Self { params, ret })
    }

    pub fn params(&self) -> &[ExternType] {
        &self.params
    }

    pub fn ret(&self) -> ExternType {
        self.ret
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for FnSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}
