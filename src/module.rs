//! Module registry.
//!
//! JIT-produced libraries register themselves here during their static
//! initializer phase, before any caller code runs. The registry lives in the
//! global state and is destroyed last during teardown.

use crate::global::global_state;
use crate::rt_debug;

/// Descriptor for one module registered with the runtime.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    /// Unique module name.
    pub name: String,
    /// Initializer run at runtime init (or immediately, when registration
    /// happens after init). Typically calls `init_module_globals`.
    pub init: Option<fn()>,
    /// Index of the module's globals slot, assigned by the linker.
    pub globals_idx: usize,
}

/// Registers a module with the runtime. Called from a loaded library's
/// initializer phase; registering the same name twice is ignored.
pub fn register_module(module: ModuleDescriptor) {
    let gs = global_state();

    {
        let modules = gs.hilti_modules.borrow();
        if modules.iter().any(|m| m.name == module.name) {
            rt_debug!("driver", "module {} already registered, ignoring", module.name);
            return;
        }
    }

    rt_debug!(
        "driver",
        "registering module {} (globals slot {})",
        module.name,
        module.globals_idx
    );

    let run_init = gs.runtime_is_initialized.get();
    let init = module.init;
    gs.hilti_modules.borrow_mut().push(module);

    // Loaded after init(): the initializer phase has already run for
    // everyone else, so run this one now.
    if run_init {
        if let Some(init) = init {
            init();
        }
    }
}

/// Looks up a registered module by name.
pub fn module_by_name(name: &str) -> Option<ModuleDescriptor> {
    global_state()
        .hilti_modules
        .borrow()
        .iter()
        .find(|m| m.name == name)
        .cloned()
}

/// Looks up a registered module by its globals index.
pub fn module_by_index(idx: usize) -> Option<ModuleDescriptor> {
    global_state()
        .hilti_modules
        .borrow()
        .iter()
        .find(|m| m.globals_idx == idx)
        .cloned()
}

/// Number of registered modules.
pub fn module_count() -> usize {
    global_state().hilti_modules.borrow().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use crate::global;
    use std::cell::Cell;

    thread_local! {
        static INIT_RUNS: Cell<u32> = const { Cell::new(0) };
    }

    fn test_init() {
        INIT_RUNS.with(|c| c.set(c.get() + 1));
        context::init_module_globals::<i64>(0);
    }

    #[test]
    fn test_register_and_lookup() {
        global::done();
        register_module(ModuleDescriptor {
            name: "Main".into(),
            init: None,
            globals_idx: 0,
        });

        let m = module_by_name("Main").expect("registered module");
        assert_eq!(m.globals_idx, 0);
        assert!(module_by_name("Other").is_none());
        assert!(module_by_index(0).is_some());
        global::done();
    }

    #[test]
    fn test_duplicate_registration_ignored() {
        global::done();
        register_module(ModuleDescriptor {
            name: "Dup".into(),
            init: None,
            globals_idx: 0,
        });
        register_module(ModuleDescriptor {
            name: "Dup".into(),
            init: None,
            globals_idx: 1,
        });

        assert_eq!(module_count(), 1);
        assert_eq!(module_by_name("Dup").unwrap().globals_idx, 0);
        global::done();
    }

    #[test]
    fn test_init_runs_registered_initializers() {
        global::done();
        INIT_RUNS.with(|c| c.set(0));

        register_module(ModuleDescriptor {
            name: "WithInit".into(),
            init: Some(test_init),
            globals_idx: 0,
        });
        assert_eq!(INIT_RUNS.with(|c| c.get()), 0);

        global::init();
        assert_eq!(INIT_RUNS.with(|c| c.get()), 1);

        // Globals slot was populated by the initializer before any module
        // code can run.
        assert_eq!(*context::module_globals::<i64>(0).borrow(), 0);
        global::done();
    }

    #[test]
    fn test_late_registration_initializes_immediately() {
        global::done();
        global::init();
        INIT_RUNS.with(|c| c.set(0));

        register_module(ModuleDescriptor {
            name: "Late".into(),
            init: Some(test_init),
            globals_idx: 0,
        });
        assert_eq!(INIT_RUNS.with(|c| c.get()), 1);
        global::done();
    }
}
