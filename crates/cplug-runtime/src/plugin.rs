//! Plugin surface: open a library and bind its symbols by declared type
//!
//! A symbol declared with a function type becomes an `ExternFunction`; any
//! other supported type is read from the symbol's address and copied into a
//! `Value`.

use crate::error::{Error, Result};
use crate::ffi::{
    read_complex128, read_complex64, read_value, ExternFunction, ExternType, FnSignature,
    HostType, Library, LibraryLoader, MarshalError,
};
use crate::value::{RawAddress, Value};

/// Result of binding a symbol
#[derive(Debug)]
pub enum BoundValue {
    /// A callable native function
    Function(ExternFunction),
    /// A copy of a data symbol (or, for `HostType::Pointer`, its address)
    Value(Value),
}

impl BoundValue {
    pub fn into_function(self) -> Option<ExternFunction> {
        match self {
            BoundValue::Function(f) => Some(f),
            BoundValue::Value(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            BoundValue::Value(v) => Some(v),
            BoundValue::Function(_) => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, BoundValue::Function(_))
    }
}

/// Bind a named symbol of `library` as `ty`
///
/// - function types become an `ExternFunction` tied to the library handle
/// - `HostType::Pointer` yields the symbol's address
/// - complex types read `[re, im]` from the address
/// - other supported types are read from the address
///   (`HostType::C(ExternType::Pointer)` reads a `void*` variable)
///
/// Data is read while the library is held open. Unsupported types are
/// rejected before the symbol is resolved.
///
/// # Safety
///
/// `ty` must describe the symbol truthfully: a function's real signature
/// must match, and a data symbol must hold a value of the declared type.
pub unsafe fn bind_symbol(library: &Library, name: &str, ty: &HostType) -> Result<BoundValue> {
    let unsupported = || Error::UnsupportedType {
        symbol: name.to_string(),
        ty: ty.to_string(),
    };

    match ty {
        HostType::Function(sig) => {
            let signature = FnSignature::from_signature(sig).map_err(|e| {
                tracing::debug!(symbol = name, reason = e.reason, "rejected signature");
                unsupported()
            })?;
            let code = library.symbol(name)?;
            let function = ExternFunction::new(code, signature, Some(library.clone()))?;
            tracing::debug!(
                library = library.name(),
                symbol = name,
                signature = %function.signature(),
                "bound function"
            );
            Ok(BoundValue::Function(function))
        }

        HostType::Pointer => Ok(BoundValue::Value(Value::Pointer(library.symbol(name)?))),

        HostType::Complex64 => {
            let value = library.with_symbol(name, |addr| read_complex64(addr))??;
            Ok(BoundValue::Value(value))
        }

        HostType::Complex128 => {
            let value = library.with_symbol(name, |addr| read_complex128(addr))??;
            Ok(BoundValue::Value(value))
        }

        other => {
            let ext = ExternType::from_host(other).ok_or_else(unsupported)?;
            let value = library.with_symbol(name, |addr| read_data_symbol(name, addr, ext))??;
            tracing::debug!(library = library.name(), symbol = name, ty = %ext, "read data symbol");
            Ok(BoundValue::Value(value))
        }
    }
}

/// Read the data symbol `name` of kind `ty` at `addr`
///
/// # Safety
///
/// Same contract as [`read_value`].
unsafe fn read_data_symbol(name: &str, addr: RawAddress, ty: ExternType) -> Result<Value> {
    if ty == ExternType::Void {
        return Err(Error::NotAPointer {
            symbol: name.to_string(),
        });
    }

    match read_value(addr, ty) {
        Ok(value) => Ok(value),
        Err(MarshalError::NullPointer(_)) if ty == ExternType::CharPtr && !addr.is_null() => {
            Err(Error::NilPointer {
                symbol: name.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// An opened native library
///
/// ```no_run
/// use cplug_runtime::{HostType, Plugin, Value};
///
/// let plugin = Plugin::open("libm.so.6")?;
/// let fabs = unsafe {
///     plugin.lookup_c("fabs", &HostType::function(vec![HostType::F64], Some(HostType::F64)))?
/// }
/// .into_function()
/// .unwrap();
/// assert_eq!(fabs.call(&[Value::F64(-42.0)])?, Value::F64(42.0));
/// # Ok::<(), cplug_runtime::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Plugin {
    library: Library,
}

impl Plugin {
    /// Open a library with the default loader (binding mode `NOW`)
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(&LibraryLoader::new(), name)
    }

    /// Open a library through a configured loader
    pub fn open_with(loader: &LibraryLoader, name: &str) -> Result<Self> {
        let library = loader.open(name)?;
        Ok(Self { library })
    }

    /// Wrap an already opened library
    pub fn from_library(library: Library) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn name(&self) -> &str {
        self.library.name()
    }

    /// Resolve a symbol's address
    pub fn symbol(&self, name: &str) -> Result<RawAddress> {
        Ok(self.library.symbol(name)?)
    }

    /// Bind a symbol by declared type
    ///
    /// # Safety
    ///
    /// See [`bind_symbol`].
    pub unsafe fn lookup_c(&self, name: &str, ty: &HostType) -> Result<BoundValue> {
        bind_symbol(&self.library, name, ty)
    }

    /// Close the library
    ///
    /// Functions bound from it fail with `HandleClosed` afterwards.
    pub fn close(&self) -> Result<()> {
        Ok(self.library.close()?)
    }
}
