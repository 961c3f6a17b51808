//! Shared-library artifacts produced by the JIT.
//!
//! A `Library` owns the `.hlto` file on disk (absolute path, so it survives
//! working-directory changes) and, once loaded, the OS-level module handle.
//! Every artifact carries an embedded version record used for a
//! compatibility check at load time.

use std::cell::RefCell;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use object::{Object, ObjectSection};

use crate::error::{HError, HResult};
use crate::rt_debug;

/// Name of the artifact section holding the JSON version record.
pub const VERSION_SECTION: &str = ".hlto.version";

/// Magic string identifying runtime artifacts.
pub const VERSION_MAGIC: &str = "hlto";

/// Version information embedded as JSON into produced libraries.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    /// Magic string for identification.
    pub magic: String,
    /// Runtime version the library was produced with.
    pub version: String,
    /// Time the library was produced, in seconds since the epoch.
    pub created: u64,
    /// True if produced in debug mode.
    pub debug: bool,
    /// True if produced with optimizations enabled.
    pub optimize: bool,
}

impl Version {
    /// The record for an artifact produced right now by this runtime.
    pub fn current(debug: bool, optimize: bool) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Version {
            magic: VERSION_MAGIC.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created,
            debug,
            optimize,
        }
    }

    /// Serialize to the embedded JSON form.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "magic": self.magic,
            "version": self.version,
            "created": self.created,
            "debug": self.debug,
            "optimize": self.optimize,
        })
        .to_string()
    }

    /// Parse the embedded JSON form.
    pub fn from_json(json: &str) -> HResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| HError::library_failed(format!("invalid version record: {}", e)))?;
        let field = |name: &str| -> HResult<&serde_json::Value> {
            value
                .get(name)
                .ok_or_else(|| HError::library_failed(format!("version record missing '{}'", name)))
        };
        Ok(Version {
            magic: field("magic")?.as_str().unwrap_or_default().to_string(),
            version: field("version")?.as_str().unwrap_or_default().to_string(),
            created: field("created")?.as_u64().unwrap_or(0),
            debug: field("debug")?.as_bool().unwrap_or(false),
            optimize: field("optimize")?.as_bool().unwrap_or(false),
        })
    }

    /// Check compatibility with the current runtime. Warns on mismatches
    /// but does not abort: artifacts are transient by construction.
    pub fn check_compatibility(&self) {
        if self.magic != VERSION_MAGIC {
            eprintln!(
                "warning: library does not look like a runtime artifact (magic '{}')",
                self.magic
            );
        }
        if self.version != env!("CARGO_PKG_VERSION") {
            eprintln!(
                "warning: library was produced by runtime version {}, this is {}",
                self.version,
                env!("CARGO_PKG_VERSION")
            );
        }
    }
}

/// Container for code compiled into a native shared library.
pub struct Library {
    /// Absolute path to the physical file wrapped by this instance.
    path: PathBuf,
    /// Keeps a JIT-produced temporary alive (and deletes it) for exactly
    /// this library's lifetime.
    _temp: Option<tempfile::TempPath>,
    /// Handle to the loaded library.
    handle: RefCell<Option<libloading::Library>>,
}

impl Library {
    /// Wrap an existing library file. The path is made absolute so later
    /// operations survive working-directory changes.
    pub fn new(path: impl AsRef<Path>) -> HResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HError::library_failed(format!(
                "no such library: {}",
                path.display()
            )));
        }
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(Library {
            path,
            _temp: None,
            handle: RefCell::new(None),
        })
    }

    /// Wrap a freshly produced temporary artifact; the file is removed when
    /// this library is dropped.
    pub(crate) fn from_temp(temp: tempfile::TempPath) -> HResult<Self> {
        let mut library = Library::new(&temp)?;
        library._temp = Some(temp);
        Ok(library)
    }

    /// Absolute path of the wrapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the library into the current process and return its embedded
    /// version record after a compatibility check.
    pub fn open(&self) -> HResult<Version> {
        if self.handle.borrow().is_none() {
            rt_debug!("driver", "loading library {}", self.path.display());
            // Safety: artifacts are produced by this process's own JIT
            // pipeline; their initializers only register modules with the
            // runtime.
            let lib = unsafe { libloading::Library::new(&self.path) }.map_err(|e| {
                HError::library_failed(format!("failed to load {}: {}", self.path.display(), e))
            })?;
            *self.handle.borrow_mut() = Some(lib);
        }

        let version = self.version()?;
        version.check_compatibility();
        Ok(version)
    }

    /// Read the embedded version record without loading the library.
    pub fn version(&self) -> HResult<Version> {
        let data = std::fs::read(&self.path)
            .map_err(|e| HError::library_failed(format!("failed to read library: {}", e)))?;
        let file = object::File::parse(&*data)
            .map_err(|e| HError::library_failed(format!("failed to parse library: {}", e)))?;
        let section = file
            .section_by_name(VERSION_SECTION)
            .ok_or_else(|| HError::library_failed("library carries no version record"))?;
        let bytes = section
            .data()
            .map_err(|e| HError::library_failed(format!("failed to read version record: {}", e)))?;
        Version::from_json(&String::from_utf8_lossy(bytes))
    }

    /// Save this library under a different path.
    pub fn save(&self, path: impl AsRef<Path>) -> HResult<()> {
        std::fs::copy(&self.path, path.as_ref()).map_err(|e| {
            HError::library_failed(format!(
                "failed to save library to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Resolve a symbol from the loaded library.
    pub fn symbol(&self, name: &str) -> HResult<*const c_void> {
        let handle = self.handle.borrow();
        let lib = handle
            .as_ref()
            .ok_or_else(|| HError::library_failed("library not loaded"))?;
        // Safety: the pointer is only produced, not called, here; callers
        // cast it to the signature the generated code exports.
        unsafe {
            lib.get::<*const c_void>(name.as_bytes())
                .map(|sym| *sym)
                .map_err(|e| {
                    HError::library_failed(format!(
                        "symbol '{}' not found in {}: {}",
                        name,
                        self.path.display(),
                        e
                    ))
                })
        }
    }

    /// Remove the file corresponding to this library without unloading it.
    pub fn remove(&self) -> HResult<()> {
        std::fs::remove_file(&self.path)
            .map_err(|e| HError::library_failed(format!("failed to remove library: {}", e)))
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<library {} {}>",
            self.path.display(),
            if self.handle.borrow().is_some() {
                "loaded"
            } else {
                "unloaded"
            }
        )
    }
}
