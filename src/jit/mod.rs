//! JIT pipeline for generated C++ code.
//!
//! The code generator hands this pipeline C++ translation units (inline
//! source or paths). Each unit is compiled to an in-memory intermediate
//! module by the external compiler driver and queued; `jit()` then links
//! all pending modules into one, uniquifies the externally visible
//! constructor symbols so repeated rounds can coexist in one process,
//! emits the final object, produces a shared library, and loads it.
//!
//! ## Architecture
//!
//! ```text
//! C++ unit -> driver (-c) -> CodeUnit queue -> relocatable link
//!          -> verify -> uniquify/internalize -> emit -> driver (-shared)
//!          -> .hlto -> dlopen
//! ```
//!
//! Every intermediate file is a temporary cleaned up on all exit paths;
//! `set_dump_code()` additionally writes `dbg.`-prefixed copies to the
//! working directory for debugging.

mod driver;
mod symbols;

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use object::Object;
use rustc_hash::FxHashMap;

use crate::config::Configuration;
use crate::error::{HError, HResult};
use crate::library::{Library, Version, VERSION_SECTION};
use crate::rt_debug;

/// One compiled translation unit awaiting link.
struct CodeUnit {
    id: String,
    object: Vec<u8>,
}

/// The merged module after link, verify, and the visibility rewrite.
struct LinkedModule {
    bytes: Vec<u8>,
    trigger: String,
    renamed: FxHashMap<String, String>,
}

/// JIT compiler pipeline.
pub struct Jit {
    config: Configuration,
    /// FIFO queue of intermediate modules to be just-in-timed.
    queue: VecDeque<CodeUnit>,
    dump_code: bool,
    shared_library: Option<Library>,
    next_unit: u64,
}

impl Jit {
    pub fn new(config: Configuration) -> Self {
        Jit {
            config,
            queue: VecDeque::new(),
            dump_code: false,
            shared_library: None,
            next_unit: 0,
        }
    }

    /// Version banner of the external compiler driver.
    pub fn compiler_version(&self) -> HResult<String> {
        driver::compiler_version(&self.config)
    }

    /// Whether the configured external driver is usable.
    pub fn compiler_available(&self) -> bool {
        driver::compiler_available(&self.config)
    }

    /// Write per-stage artifacts to the working directory for debugging.
    pub fn set_dump_code(&mut self) {
        self.dump_code = true;
    }

    /// Compile a C++ translation unit from a file and enqueue the result.
    /// On failure the queue is untouched and the pipeline stays usable.
    pub fn compile_file(&mut self, path: impl AsRef<Path>) -> HResult<()> {
        let path = path.as_ref();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unit".to_string());
        self.compile_unit(&id, path)
    }

    /// Compile inline C++ source and enqueue the result.
    pub fn compile_code(&mut self, id: &str, code: &str) -> HResult<()> {
        // The unit id becomes part of the temp file name, and with it the
        // names the compiler invents for the unit's constructors.
        let unique = format!("{}_{}", id, self.next_unit);
        self.next_unit += 1;

        let dir = tempfile::tempdir()
            .map_err(|e| HError::compile_failed(format!("cannot create temp dir: {}", e)))?;
        let source = dir.path().join(format!("{}.cc", unique));
        std::fs::write(&source, code)
            .map_err(|e| HError::compile_failed(format!("cannot write source: {}", e)))?;

        self.compile_unit(&unique, &source)
        // `dir` drops here, removing the source on success and error alike.
    }

    fn compile_unit(&mut self, id: &str, path: &Path) -> HResult<()> {
        rt_debug!("jit", "compiling module {} from {}", id, path.display());

        let obj = tempfile::Builder::new()
            .prefix(id)
            .suffix(".o")
            .tempfile()
            .map_err(|e| HError::compile_failed(format!("cannot create temp object: {}", e)))?;

        driver::compile_object(&self.config, path, obj.path())?;

        let bytes = std::fs::read(obj.path())
            .map_err(|e| HError::compile_failed(format!("cannot read object: {}", e)))?;
        if bytes.is_empty() {
            return Err(HError::compile_failed("compilation produced no object"));
        }

        self.queue.push_back(CodeUnit {
            id: id.to_string(),
            object: bytes,
        });
        Ok(())
    }

    /// Number of units awaiting link.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Link all pending modules, uniquify, emit, produce the shared
    /// library, and load it. A no-op that returns ok when the queue is
    /// empty; a second call does not re-load the prior library.
    pub fn jit(&mut self) -> HResult<()> {
        if self.queue.is_empty() {
            return Ok(());
        }

        let Some(linked) = self.link()? else {
            rt_debug!("jit", "skipping empty linked module");
            return Ok(());
        };

        for (old, new) in &linked.renamed {
            rt_debug!("jit", "uniquified symbol {} -> {}", old, new);
        }

        let library = self.compile_module(&linked)?;

        let version = library.open()?;
        rt_debug!(
            "jit",
            "loaded library {} (produced {})",
            library.path().display(),
            version.created
        );

        // Resolving one exported symbol forces the object in and proves
        // the uniquified exports are visible.
        library.symbol(&linked.trigger)?;

        if self.dump_code {
            let path = "dbg.linked.hlto";
            rt_debug!("driver", "saving shared library for linked module to {}", path);
            library.save(path)?;
        }

        self.shared_library = Some(library);
        Ok(())
    }

    /// The last successfully loaded library.
    pub fn retrieve_library(&self) -> Option<&Library> {
        self.shared_library.as_ref()
    }

    /// Link all queued modules into one and rewrite its symbol visibility.
    /// Returns `None` for a module with nothing to export.
    fn link(&mut self) -> HResult<Option<LinkedModule>> {
        let dir = tempfile::tempdir()
            .map_err(|e| HError::link_failed(format!("cannot create temp dir: {}", e)))?;

        let mut inputs = Vec::with_capacity(self.queue.len());
        for unit in self.queue.drain(..) {
            if self.dump_code {
                let path = format!("dbg.{}.o", unit.id);
                rt_debug!("driver", "saving object for module {} to {}", unit.id, path);
                let _ = std::fs::write(&path, &unit.object);
            }
            let path = dir.path().join(format!("{}.o", unit.id));
            std::fs::write(&path, &unit.object)
                .map_err(|e| HError::link_failed(format!("cannot stage object: {}", e)))?;
            inputs.push(path);
        }

        let merged_path = dir.path().join("linked.o");
        driver::link_relocatable(&self.config, &inputs, &merged_path)?;
        let merged = std::fs::read(&merged_path)
            .map_err(|e| HError::link_failed(format!("cannot read linked module: {}", e)))?;

        // Verify the merged module before operating on it.
        let file = object::File::parse(&*merged)
            .map_err(|e| HError::verify_failed(e.to_string()))?;
        if file.symbols().next().is_none() {
            return Ok(None);
        }

        // Symbols we must rename to be globally unique: they stay
        // externally visible, and more than one JIT round may define them.
        let mut uniquify = symbols::collect_constructor_symbols(&file);
        uniquify.insert("__linker__".to_string());
        let expose: BTreeSet<String> = ["hilti_main".to_string()].into_iter().collect();

        // The tag is the address of a per-round allocation that is never
        // freed, so no two rounds in this process can produce the same
        // suffix.
        let tag = Box::leak(Box::new(0u8)) as *const u8 as usize;

        let version = Version::current(self.config.debug, self.config.optimize);
        let note = version.to_json();

        let outcome = symbols::adapt_symbol_visibility(
            &file,
            &uniquify,
            &expose,
            tag,
            Some((VERSION_SECTION, note.as_bytes())),
        )?;

        let Some(trigger) = outcome.trigger.clone() else {
            return Ok(None);
        };
        rt_debug!("jit", "materialization trigger is {}", trigger);

        if self.dump_code {
            let path = "dbg.linked.o";
            rt_debug!("driver", "saving linked module to {}", path);
            let _ = std::fs::write(path, &outcome.bytes);
        }

        Ok(Some(LinkedModule {
            bytes: outcome.bytes,
            trigger,
            renamed: outcome.renamed,
        }))
        // `dir` drops here, removing all staged objects on every path.
    }

    /// Emit the linked module to disk and produce the shared library.
    fn compile_module(&self, linked: &LinkedModule) -> HResult<Library> {
        let obj = tempfile::Builder::new()
            .prefix("linked")
            .suffix(".o")
            .tempfile()
            .map_err(|e| HError::object_emit_failed(format!("cannot create object file: {}", e)))?;
        std::fs::write(obj.path(), &linked.bytes)
            .map_err(|e| HError::object_emit_failed(format!("cannot write object file: {}", e)))?;

        let lib = tempfile::Builder::new()
            .prefix("linked")
            .suffix(".hlto")
            .tempfile()
            .map_err(|e| HError::driver_failed(format!("cannot create library file: {}", e)))?
            .into_temp_path();

        rt_debug!("jit", "creating shared library {}", lib.display());
        driver::link_shared(&self.config, obj.path(), &lib)?;

        Library::from_temp(lib)
        // `obj` drops here, removing the emitted object on every path.
    }
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<jit pending={} loaded={}>",
            self.queue.len(),
            self.shared_library.is_some()
        )
    }
}
