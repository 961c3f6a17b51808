//! Process-wide runtime state.
//!
//! All truly global runtime state is collected in one struct so that what
//! exists is visible in one place and the teardown order is explicit. The
//! state is confined to the thread that created it: contexts, the fiber
//! cache, and the registry are never shared across OS threads, which
//! enforces the single-threaded cooperative discipline structurally.
//!
//! Teardown runs in field declaration order (Rust drops struct fields top to
//! bottom): the fiber cache first, then the master context and the shared
//! stack, and the module registry last, because other teardown paths may
//! still resolve module descriptors.

use std::cell::{Cell, RefCell};
use std::mem::MaybeUninit;
use std::rc::Rc;

use crate::config::Configuration;
use crate::context::Context;
use crate::fiber::{Fiber, SharedStack};
use crate::logging::DebugLogger;
use crate::module::ModuleDescriptor;
use crate::rt_debug;

/// Resource usage snapshot, taken at init and on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// User CPU time in seconds.
    pub user_time: f64,
    /// System CPU time in seconds.
    pub system_time: f64,
    /// Maximum resident set size in kilobytes.
    pub max_rss: i64,
}

/// Current resource usage of the process.
pub fn resource_usage() -> ResourceUsage {
    let mut usage = MaybeUninit::<libc::rusage>::uninit();
    // getrusage only writes the struct; RUSAGE_SELF is always valid.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return ResourceUsage::default();
    }
    let usage = unsafe { usage.assume_init() };
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    ResourceUsage {
        user_time: seconds(usage.ru_utime),
        system_time: seconds(usage.ru_stime),
        max_rss: usage.ru_maxrss as i64,
    }
}

/// Struct capturing all truly global runtime state.
///
/// Non-copyable and non-movable once installed; accessed through
/// `global_state()`.
pub struct GlobalState {
    /// True once `init()` has finished.
    pub runtime_is_initialized: Cell<bool>,

    /// If not zero, `Configuration::abort_on_errors` is disabled.
    pub disable_abort_on_errors: Cell<u32>,

    /// Resource usage at runtime initialization time.
    pub resource_usage_init: Cell<ResourceUsage>,

    /// The runtime's configuration.
    pub configuration: RefCell<Configuration>,

    /// Debug logger recording runtime diagnostics.
    pub debug_logger: DebugLogger,

    /// Cache of previously used fibers available for reuse.
    pub fiber_cache: RefCell<Vec<Box<Fiber>>>,

    /// The context for the main thread.
    pub master_context: Context,

    /// Shared stack for fiber execution.
    pub shared_stack: RefCell<SharedStack>,

    /// List of modules registered with the runtime, filled through
    /// `register_module` from a loaded library's initializer phase.
    ///
    /// Declared last: destroying other fields may still need this
    /// information.
    pub hilti_modules: RefCell<Vec<ModuleDescriptor>>,
}

impl GlobalState {
    fn new() -> Self {
        GlobalState {
            runtime_is_initialized: Cell::new(false),
            disable_abort_on_errors: Cell::new(0),
            resource_usage_init: Cell::new(ResourceUsage::default()),
            configuration: RefCell::new(Configuration::default()),
            debug_logger: DebugLogger::from_env(),
            fiber_cache: RefCell::new(Vec::new()),
            master_context: Context::new(),
            shared_stack: RefCell::new(SharedStack::new()),
            hilti_modules: RefCell::new(Vec::new()),
        }
    }
}

thread_local! {
    static GLOBAL: RefCell<Option<Rc<GlobalState>>> = const { RefCell::new(None) };
}

/// Returns the global state singleton, creating it on first call.
pub fn global_state() -> Rc<GlobalState> {
    let existing = GLOBAL.with(|g| g.borrow().clone());
    if let Some(gs) = existing {
        return gs;
    }
    let fresh = Rc::new(GlobalState::new());
    GLOBAL.with(|g| {
        let mut slot = g.borrow_mut();
        if slot.is_none() {
            *slot = Some(fresh.clone());
        }
        slot.as_ref().cloned().unwrap_or(fresh)
    })
}

/// Like `global_state()`, but returns `None` during thread teardown instead
/// of re-creating state. Cleanup paths use this.
pub fn try_global_state() -> Option<Rc<GlobalState>> {
    GLOBAL.try_with(|_| ()).ok()?;
    Some(global_state())
}

/// Initializes the runtime: snapshots resource usage, runs the initializers
/// of all modules registered so far, and marks the runtime ready.
/// Idempotent.
pub fn init() {
    let gs = global_state();
    if gs.runtime_is_initialized.get() {
        return;
    }

    gs.resource_usage_init.set(resource_usage());

    // Copy the init functions out first: an initializer may register
    // further modules, which would re-borrow the registry.
    let inits: Vec<(String, Option<fn()>)> = gs
        .hilti_modules
        .borrow()
        .iter()
        .map(|m| (m.name.clone(), m.init))
        .collect();

    for (name, init) in inits {
        rt_debug!("driver", "initializing module {}", name);
        if let Some(init) = init {
            init();
        }
    }

    gs.runtime_is_initialized.set(true);
    rt_debug!("driver", "runtime initialized");
}

/// True once `init()` has finished.
pub fn is_initialized() -> bool {
    match try_global_state() {
        Some(gs) => gs.runtime_is_initialized.get(),
        None => false,
    }
}

/// Tears down the runtime state. Fields are destroyed in declaration order,
/// module registry last. Idempotent; a later `global_state()` call starts
/// fresh.
pub fn done() {
    // Log through the outgoing state directly: the usual logging path
    // would lazily re-create a fresh singleton mid-teardown.
    let state = GLOBAL.with(|g| g.borrow_mut().take());
    if let Some(gs) = &state {
        gs.debug_logger.debug("driver", "shutting down runtime");
        gs.runtime_is_initialized.set(false);
    }
    drop(state);
}
