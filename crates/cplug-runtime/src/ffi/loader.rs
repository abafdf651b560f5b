//! Dynamic library loading
//!
//! `Library` is a shared handle to one opened shared library. Clones refer to
//! the same handle; closing it through any clone closes it for all of them.
//! Bound functions hold a read lock on the handle while they run, so `close`
//! waits for in-flight calls and later calls fail with `HandleClosed`.
//!
//! `LibraryLoader` resolves short names (`m`, `sqlite3`) against search
//! paths using the platform's naming conventions before handing the result
//! to the OS loader.

use crate::value::RawAddress;
use bitflags::bitflags;
use cplug_config::Config;
use parking_lot::{RwLock, RwLockReadGuard};
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Library loading errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("library not found: {0}")]
    LibraryNotFound(String),

    #[error("failed to load library '{library}': {reason}")]
    LoadFailed { library: String, reason: String },

    #[error("symbol '{symbol}' not found in library '{library}': {reason}")]
    SymbolNotFound {
        library: String,
        symbol: String,
        reason: String,
    },

    #[error("failed to close library '{library}': {reason}")]
    CloseFailed { library: String, reason: String },

    #[error("library '{0}' is already closed")]
    AlreadyClosed(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("unknown open flag '{0}'")]
    InvalidFlag(String),
}

bitflags! {
    /// How a library is opened
    ///
    /// Mirrors the `dlopen` mode bits. On platforms without `dlopen` the
    /// flags are accepted and ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Resolve symbols when first used
        const LAZY = 1;
        /// Resolve all symbols at open time
        const NOW = 1 << 1;
        /// Make symbols available to libraries opened later
        const GLOBAL = 1 << 2;
        /// Keep symbols private to this handle
        const LOCAL = 1 << 3;
        /// Only succeed if the library is already loaded
        const NOLOAD = 1 << 4;
        /// Never unload the library, even after close
        const NODELETE = 1 << 5;
    }
}

impl OpenFlags {
    /// Parse the flag names used in configuration files
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, LoadError> {
        names.iter().try_fold(OpenFlags::empty(), |flags, name| {
            let flag = match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "lazy" => OpenFlags::LAZY,
                "now" => OpenFlags::NOW,
                "global" => OpenFlags::GLOBAL,
                "local" => OpenFlags::LOCAL,
                "noload" => OpenFlags::NOLOAD,
                "nodelete" => OpenFlags::NODELETE,
                other => return Err(LoadError::InvalidFlag(other.to_string())),
            };
            Ok(flags | flag)
        })
    }

    /// `dlopen` mode bits
    ///
    /// Binding defaults to `RTLD_NOW` and visibility to `RTLD_LOCAL` when
    /// not given.
    #[cfg(unix)]
    pub fn to_raw(self) -> std::ffi::c_int {
        let mut raw = if self.contains(OpenFlags::LAZY) && !self.contains(OpenFlags::NOW) {
            libc::RTLD_LAZY
        } else {
            libc::RTLD_NOW
        };
        raw |= if self.contains(OpenFlags::GLOBAL) {
            libc::RTLD_GLOBAL
        } else {
            libc::RTLD_LOCAL
        };
        if self.contains(OpenFlags::NOLOAD) {
            raw |= libc::RTLD_NOLOAD;
        }
        if self.contains(OpenFlags::NODELETE) {
            raw |= libc::RTLD_NODELETE;
        }
        raw
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::NOW
    }
}

struct LibraryInner {
    name: String,
    handle: RwLock<Option<libloading::Library>>,
}

/// Read guard proving a library is open
pub(crate) type LiveGuard<'a> = RwLockReadGuard<'a, Option<libloading::Library>>;

/// Shared handle to an opened library
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

impl Library {
    /// Open a library by path or by a name the OS loader can find
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        if name.is_empty() || name.contains('\0') {
            return Err(LoadError::InvalidName(name));
        }

        // Safety: running a library's initializers is inherent to loading it;
        // callers choose which libraries to trust.
        let handle = unsafe { open_native(path, flags) }.map_err(|e| LoadError::LoadFailed {
            library: name.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(library = %name, ?flags, "opened library");

        Ok(Self {
            inner: Arc::new(LibraryInner {
                name,
                handle: RwLock::new(Some(handle)),
            }),
        })
    }

    /// Close the library
    ///
    /// Waits for bound calls that are running. Every clone of this handle
    /// sees the library as closed afterwards.
    pub fn close(&self) -> Result<(), LoadError> {
        let handle = self
            .inner
            .handle
            .write()
            .take()
            .ok_or_else(|| LoadError::AlreadyClosed(self.inner.name.clone()))?;

        handle.close().map_err(|e| LoadError::CloseFailed {
            library: self.inner.name.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(library = %self.inner.name, "closed library");
        Ok(())
    }

    /// Resolve the address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<RawAddress, LoadError> {
        self.with_symbol(name, |addr| addr)
    }

    /// Resolve a symbol and use its address while the library is held open
    ///
    /// `close` cannot complete until `f` returns, so `f` may read through
    /// the address.
    pub fn with_symbol<R>(
        &self,
        name: &str,
        f: impl FnOnce(RawAddress) -> R,
    ) -> Result<R, LoadError> {
        if name.is_empty() || name.contains('\0') {
            return Err(LoadError::InvalidName(name.to_string()));
        }

        let guard = self.inner.handle.read_recursive();
        let lib = guard
            .as_ref()
            .ok_or_else(|| LoadError::AlreadyClosed(self.inner.name.clone()))?;

        // Safety: the symbol is only read as an address, never called here.
        let sym = unsafe { lib.get::<*mut c_void>(name.as_bytes()) }.map_err(|e| {
            LoadError::SymbolNotFound {
                library: self.inner.name.clone(),
                symbol: name.to_string(),
                reason: e.to_string(),
            }
        })?;

        let addr = RawAddress::new(*sym);
        tracing::trace!(library = %self.inner.name, symbol = name, %addr, "resolved symbol");
        Ok(f(addr))
    }

    pub fn is_open(&self) -> bool {
        self.inner.handle.read_recursive().is_some()
    }

    /// Name the library was opened with
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Shared lock held for the duration of a bound call
    ///
    /// `None` once the library is closed. The lock is taken recursively: a
    /// bound call may re-enter the library through a callback while `close`
    /// is waiting for the write side.
    pub(crate) fn live(&self) -> Option<LiveGuard<'_>> {
        let guard = self.inner.handle.read_recursive();
        guard.is_some().then_some(guard)
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(unix)]
unsafe fn open_native(
    path: &Path,
    flags: OpenFlags,
) -> Result<libloading::Library, libloading::Error> {
    libloading::os::unix::Library::open(Some(path), flags.to_raw()).map(Into::into)
}

#[cfg(not(unix))]
unsafe fn open_native(
    path: &Path,
    _flags: OpenFlags,
) -> Result<libloading::Library, libloading::Error> {
    libloading::Library::new(path)
}

/// Resolves library names against search paths and opens them
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    search_paths: Vec<PathBuf>,
    flags: OpenFlags,
}

impl LibraryLoader {
    /// Create a loader with the platform's default search paths
    pub fn new() -> Self {
        Self {
            search_paths: Self::default_search_paths(),
            flags: OpenFlags::default(),
        }
    }

    /// Create a loader from merged configuration
    ///
    /// Configured search paths come first, then the defaults; the open mode
    /// becomes the loader's default flags.
    pub fn from_config(config: &Config) -> Result<Self, LoadError> {
        let flags = OpenFlags::from_names(&config.open_mode())?;
        let mut search_paths = config.search_paths();
        search_paths.extend(Self::default_search_paths());
        Ok(Self {
            search_paths,
            flags,
        })
    }

    /// Use exactly these search paths
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Add a search path ahead of the existing ones
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Platform default search paths
    ///
    /// - Linux: /usr/lib, /usr/local/lib, /lib (+ lib64 variants)
    /// - macOS: /usr/lib, /usr/local/lib, /opt/homebrew/lib
    /// - Windows: System32
    /// - All platforms: current working directory first
    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));
            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            match std::env::var("SystemRoot") {
                Ok(root) => paths.push(PathBuf::from(root).join("System32")),
                Err(_) => paths.push(PathBuf::from("C:\\Windows\\System32")),
            }
        }

        paths
    }

    /// File names tried for a short library name, in priority order
    ///
    /// The name itself comes first, so `libm.so.6` is found as given.
    pub fn candidate_file_names(name: &str) -> Vec<String> {
        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        let mut names = vec![name.to_string()];
        for prefix in prefixes {
            for ext in extensions {
                let candidate = format!("{}{}.{}", prefix, name, ext);
                if !names.contains(&candidate) {
                    names.push(candidate);
                }
            }
        }
        names
    }

    /// Find a library file for `name` in the search paths
    ///
    /// Names containing a path separator are treated as paths and only
    /// checked for existence.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }

        let candidates = Self::candidate_file_names(name);
        self.search_paths.iter().find_map(|dir| {
            candidates
                .iter()
                .map(|file| dir.join(file))
                .find(|full| full.is_file())
        })
    }

    /// Open a library with the loader's default flags
    pub fn open(&self, name: &str) -> Result<Library, LoadError> {
        self.open_with(name, self.flags)
    }

    /// Open a library with explicit flags
    ///
    /// A resolved file is tried first; if nothing resolves, or the resolved
    /// file cannot be loaded, the bare name is handed to the OS loader so its
    /// own search (`LD_LIBRARY_PATH`, the linker cache...) still applies.
    pub fn open_with(&self, name: &str, flags: OpenFlags) -> Result<Library, LoadError> {
        if name.trim().is_empty() {
            return Err(LoadError::InvalidName(name.to_string()));
        }

        let is_path = Path::new(name).components().count() > 1;
        let first_error = match self.resolve(name) {
            Some(path) => match Library::open(&path, flags) {
                Ok(lib) => return Ok(lib),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "resolved library failed to load");
                    Some(e)
                }
            },
            None if is_path => return Err(LoadError::LibraryNotFound(name.to_string())),
            None => None,
        };

        Library::open(name, flags).map_err(|e| first_error.unwrap_or(e))
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}
