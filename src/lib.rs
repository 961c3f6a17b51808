//! # HILTI runtime substrate
//!
//! Runtime core for a just-in-time compiled data-processing language. The
//! surrounding toolchain (parser, type checker, code generator, driver CLI)
//! lives elsewhere; this crate provides the two subsystems generated code
//! runs on:
//!
//! 1. **The JIT pipeline** ([`jit`]): compiles generated C++ translation
//!    units through the external system compiler, links the intermediate
//!    modules into one, uniquifies externally visible constructor symbols
//!    so repeated JIT rounds coexist in one process, emits a shared
//!    library, and loads it.
//! 2. **The execution substrate**: cooperative fibers over a shared stack
//!    with a reuse cache ([`fiber`]), per-context module globals
//!    ([`context`], [`global`], [`module`]), and the value/strong/weak
//!    reference trio generated code uses to model ownership and cyclic
//!    data ([`reference`]).
//!
//! ## Quick start
//!
//! ```
//! use hilti::{execute, Step, ValueReference};
//!
//! hilti::init();
//!
//! let r = ValueReference::new(41i64);
//! r.assign(42).unwrap();
//!
//! let result = execute(Box::new(move |_stack| {
//!     Step::Done(Ok(Box::new(*r.deref().unwrap())))
//! }))
//! .unwrap();
//! assert_eq!(*result.downcast::<i64>().unwrap(), 42);
//!
//! hilti::done();
//! ```
//!
//! Scheduling is single-threaded cooperative throughout; the runtime state
//! is confined to the thread that created it.

pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod global;
pub mod jit;
pub mod library;
pub mod logging;
pub mod module;
pub mod reference;

pub use config::Configuration;
pub use error::{DisableAbortOnErrors, ErrorKind, HError, HResult};
pub use fiber::{execute, Fiber, Resumable, Step};
pub use global::{done, global_state, init, is_initialized, resource_usage};
pub use jit::Jit;
pub use library::Library;
pub use module::{register_module, ModuleDescriptor};
pub use reference::{Control, Controllable, StrongReference, ValueReference, WeakReference};
