//! Runtime and JIT configuration.

use std::path::PathBuf;

/// Configuration observed by the runtime core. The driver CLI fills this in
/// and installs it before initializing the runtime.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Select the debug compiler flag set instead of the release set.
    pub debug: bool,
    /// Enable aggressive codegen for JIT-produced modules.
    pub optimize: bool,
    /// Path to the external C++ compiler driver.
    pub cxx: PathBuf,
    /// Additional include paths passed to the driver.
    pub cxx_include_paths: Vec<PathBuf>,
    /// Compiler resource directory, if it needs to be pinned.
    pub cxx_resource_dir: Option<PathBuf>,
    /// Flag set used when `debug` is on.
    pub cxx_flags_debug: Vec<String>,
    /// Flag set used when `debug` is off.
    pub cxx_flags_release: Vec<String>,
    /// Terminate the process when an error escapes the outer fiber boundary.
    pub abort_on_errors: bool,
    /// Soft ceiling of the fiber reuse cache.
    pub fiber_cache_size: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            debug: false,
            optimize: false,
            cxx: std::env::var_os("HILTI_CXX")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("c++")),
            cxx_include_paths: Vec::new(),
            cxx_resource_dir: None,
            cxx_flags_debug: vec!["-g".into(), "-O0".into(), "-std=c++17".into()],
            cxx_flags_release: vec!["-O2".into(), "-DNDEBUG".into(), "-std=c++17".into()],
            abort_on_errors: false,
            fiber_cache_size: 100,
        }
    }
}

impl Configuration {
    /// The driver flag set selected by the debug toggle, with the aggressive
    /// level appended when `optimize` is on.
    pub fn cxx_flags(&self) -> Vec<String> {
        let mut flags = if self.debug {
            self.cxx_flags_debug.clone()
        } else {
            self.cxx_flags_release.clone()
        };
        if self.optimize {
            flags.push("-O3".into());
        }
        flags
    }
}

/// Returns a copy of the current runtime configuration.
pub fn configuration() -> Configuration {
    crate::global::global_state().configuration.borrow().clone()
}

/// Installs a new runtime configuration.
pub fn set_configuration(config: Configuration) {
    *crate::global::global_state().configuration.borrow_mut() = config;
}
