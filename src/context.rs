//! Execution contexts and per-module global state.
//!
//! A context owns the marker for the currently running fiber and the dense
//! sequence of per-module globals slots, indexed by the integer the linker
//! assigned to each module. One master context lives in the global state;
//! additional contexts may be installed per fiber for isolation via
//! `set_current`/`clear_current`, following the thread-local pointer pattern
//! used for all "current X" plumbing in this runtime.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Per-context execution state.
pub struct Context {
    /// Id of the fiber currently running on this context, if any.
    current_fiber: Cell<Option<u64>>,
    /// One slot per registered module, holding that module's globals struct.
    hilti_globals: RefCell<Vec<Option<Rc<dyn Any>>>>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            current_fiber: Cell::new(None),
            hilti_globals: RefCell::new(Vec::new()),
        }
    }

    /// Id of the fiber currently running on this context.
    pub fn running_fiber(&self) -> Option<u64> {
        self.current_fiber.get()
    }

    pub(crate) fn swap_running_fiber(&self, fiber: Option<u64>) -> Option<u64> {
        let prev = self.current_fiber.get();
        self.current_fiber.set(fiber);
        prev
    }

    /// Number of allocated globals slots.
    pub fn globals_len(&self) -> usize {
        self.hilti_globals.borrow().len()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: Cell<Option<*const Context>> = const { Cell::new(None) };
}

/// Install a context as current. The caller keeps ownership and must call
/// `clear_current` before the context is dropped.
pub fn set_current(ctx: *const Context) {
    CURRENT.with(|c| c.set(Some(ctx)));
}

/// Clear the installed context, falling back to the master context.
pub fn clear_current() {
    CURRENT.with(|c| c.set(None));
}

/// Run a closure against the current context: the installed one, or the
/// master context once the runtime state exists. Always succeeds.
pub fn with_current<R>(f: impl FnOnce(&Context) -> R) -> R {
    let installed = CURRENT.with(|c| c.get());
    match installed {
        // Installed pointers are kept alive by their owner per `set_current`.
        Some(ptr) => f(unsafe { &*ptr }),
        None => {
            let gs = crate::global::global_state();
            f(&gs.master_context)
        }
    }
}

/// Returns the current context's globals slot for module `idx`.
///
/// The index is produced by the linker and registered through
/// `init_module_globals`; an unregistered or uninitialized index is a
/// programming error and panics.
pub fn module_globals<T: 'static>(idx: usize) -> Rc<RefCell<T>> {
    with_current(|ctx| {
        let globals = ctx.hilti_globals.borrow();
        let slot = globals
            .get(idx)
            .and_then(|s| s.as_ref())
            .unwrap_or_else(|| panic!("module globals {} accessed before initialization", idx));
        slot.clone()
            .downcast::<RefCell<T>>()
            .unwrap_or_else(|_| panic!("module globals {} accessed with wrong type", idx))
    })
}

/// Allocates the current context's globals slot for module `idx`, growing
/// the sequence if needed.
pub fn init_module_globals<T: Default + 'static>(idx: usize) {
    with_current(|ctx| {
        let mut globals = ctx.hilti_globals.borrow_mut();
        if globals.len() <= idx {
            globals.resize(idx + 1, None);
        }
        globals[idx] = Some(Rc::new(RefCell::new(T::default())));
    });
}
