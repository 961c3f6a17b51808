//! Cooperative fibers over a shared stack.
//!
//! A fiber is a unit of generated work multiplexed onto one shared stack
//! owned by the runtime. While a fiber runs, its live words sit on top of
//! the shared stack; when it suspends, they are copied aside into a
//! per-fiber save buffer sized to the actual depth, and copied back on
//! resume. Per-fiber overhead is therefore one small buffer rather than a
//! full stack, which is what makes thousands of short-lived fibers cheap.
//!
//! Scheduling is single-threaded cooperative. A fiber's task is a resumable
//! callable invoked once per resume slice; it suspends by returning
//! [`Step::Yield`] and finishes by returning [`Step::Done`] (the discipline
//! generated code compiles to). Exactly one fiber is driven at a time;
//! re-entrant execution from within a running task draws a nested fiber
//! whose stack window sits above the outer one.
//!
//! Finished fibers are recycled through a bounded cache in the global state.

use smallvec::SmallVec;
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use crate::context;
use crate::error::{HError, HResult};
use crate::global::{self, GlobalState};
use crate::rt_debug;

/// One word of fiber stack state.
pub type StackWord = u64;

/// Type-erased result of a completed task.
pub type TaskResult = HResult<Box<dyn Any>>;

/// Outcome of driving a task for one resume slice.
pub enum Step {
    /// Suspend; the fiber's stack window is copied aside until resume.
    Yield,
    /// The task finished with a result or an error.
    Done(TaskResult),
}

/// A resumable unit of generated work. Called once per resume slice with
/// the fiber's window of the shared stack.
pub type Task = Box<dyn FnMut(&StackWindow) -> Step>;

// ---------------------------------------------------------------------------
// Shared stack
// ---------------------------------------------------------------------------

/// The single stack region holding the live frames of whichever fiber is
/// running. Owned by the global state; fibers only ever touch it through
/// their [`StackWindow`].
pub struct SharedStack {
    words: SmallVec<[StackWord; 256]>,
}

impl SharedStack {
    pub fn new() -> Self {
        SharedStack {
            words: SmallVec::new(),
        }
    }

    /// Current total depth across all live windows.
    pub fn depth(&self) -> usize {
        self.words.len()
    }
}

impl Default for SharedStack {
    fn default() -> Self {
        Self::new()
    }
}

/// The running fiber's view of its region of the shared stack.
///
/// All accesses are relative to the fiber's base mark; a window can neither
/// read nor pop below it. Windows nest LIFO: a task that re-enters the
/// executor gives the nested fiber a window above its own.
pub struct StackWindow {
    gs: Rc<GlobalState>,
    base: usize,
}

impl StackWindow {
    /// Number of words in this window.
    pub fn depth(&self) -> usize {
        self.gs.shared_stack.borrow().words.len() - self.base
    }

    pub fn push(&self, word: StackWord) {
        self.gs.shared_stack.borrow_mut().words.push(word);
    }

    pub fn pop(&self) -> Option<StackWord> {
        let mut stack = self.gs.shared_stack.borrow_mut();
        if stack.words.len() > self.base {
            stack.words.pop()
        } else {
            None
        }
    }

    /// Read the word at `idx` within this window.
    pub fn get(&self, idx: usize) -> StackWord {
        let stack = self.gs.shared_stack.borrow();
        assert!(self.base + idx < stack.words.len(), "stack window read out of bounds");
        stack.words[self.base + idx]
    }

    /// Overwrite the word at `idx` within this window.
    pub fn set(&self, idx: usize, word: StackWord) {
        let mut stack = self.gs.shared_stack.borrow_mut();
        assert!(self.base + idx < stack.words.len(), "stack window write out of bounds");
        stack.words[self.base + idx] = word;
    }
}

// ---------------------------------------------------------------------------
// Fiber
// ---------------------------------------------------------------------------

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created (or recycled) but not yet started.
    Fresh,
    /// Currently executing a resume slice.
    Running,
    /// Suspended by a yield; stack window copied into the save buffer.
    Suspended,
    /// Finished (terminal). The result has been produced.
    Done,
}

impl FiberState {
    /// Human-readable name for display formatting.
    pub fn as_str(self) -> &'static str {
        match self {
            FiberState::Fresh => "fresh",
            FiberState::Running => "running",
            FiberState::Suspended => "suspended",
            FiberState::Done => "done",
        }
    }
}

struct FiberCounters {
    next_id: Cell<u64>,
    total: Cell<u64>,
    current: Cell<u64>,
    max: Cell<u64>,
}

thread_local! {
    static COUNTERS: FiberCounters = const {
        FiberCounters {
            next_id: Cell::new(1),
            total: Cell::new(0),
            current: Cell::new(0),
            max: Cell::new(0),
        }
    };
}

/// Fiber usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Fibers ever created.
    pub total: u64,
    /// Fibers currently allocated (cached ones included).
    pub current: u64,
    /// Fibers sitting in the reuse cache.
    pub cached: usize,
    /// High-water mark of concurrently allocated fibers.
    pub max: u64,
}

/// A cooperative execution context scheduled onto the shared stack.
pub struct Fiber {
    id: u64,
    state: FiberState,
    task: Option<Task>,
    /// Stack window copied aside while suspended; sized to live depth.
    save: Vec<StackWord>,
    result: Option<TaskResult>,
}

impl Fiber {
    fn new() -> Self {
        let id = COUNTERS.with(|c| {
            let id = c.next_id.get();
            c.next_id.set(id + 1);
            c.total.set(c.total.get() + 1);
            c.current.set(c.current.get() + 1);
            if c.current.get() > c.max.get() {
                c.max.set(c.current.get());
            }
            id
        });
        rt_debug!("fibers", "[{}] allocated new fiber", id);
        Fiber {
            id,
            state: FiberState::Fresh,
            task: None,
            save: Vec::new(),
            result: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == FiberState::Done
    }

    /// Words held by the save buffer while suspended.
    pub fn saved_depth(&self) -> usize {
        self.save.len()
    }

    /// Install a task into a fresh (or recycled) fiber.
    pub fn install(&mut self, task: Task) {
        assert!(
            self.state == FiberState::Fresh && self.task.is_none(),
            "fiber {} task slot not empty", self.id
        );
        self.task = Some(task);
    }

    /// Draw a fiber from the cache, or allocate one.
    pub fn create() -> Box<Fiber> {
        if let Some(gs) = global::try_global_state() {
            if let Some(fiber) = gs.fiber_cache.borrow_mut().pop() {
                rt_debug!("fibers", "[{}] reusing fiber from cache", fiber.id);
                return fiber;
            }
        }
        Box::new(Fiber::new())
    }

    /// Retire a fiber: clear its task slot and save buffer, then recycle it
    /// into the cache or release it when the cache is at its ceiling.
    pub fn destroy(mut fiber: Box<Fiber>) {
        if fiber.state == FiberState::Suspended {
            // Abandoned while suspended; its save buffer is discarded.
            rt_debug!("fibers", "[{}] discarding suspended fiber", fiber.id);
        }

        fiber.task = None;
        fiber.save = Vec::new();
        fiber.result = None;
        fiber.state = FiberState::Fresh;

        if let Some(gs) = global::try_global_state() {
            let ceiling = gs.configuration.borrow().fiber_cache_size;
            let mut cache = gs.fiber_cache.borrow_mut();
            if cache.len() < ceiling {
                rt_debug!("fibers", "[{}] putting fiber back into cache", fiber.id);
                cache.push(fiber);
                return;
            }
        }

        rt_debug!("fibers", "[{}] cache size exceeded, deleting finished fiber", fiber.id);
    }

    /// Pre-populate the cache up to the ceiling.
    pub fn prime_cache() {
        let ceiling = global::global_state()
            .configuration
            .borrow()
            .fiber_cache_size;

        let mut fibers = Vec::with_capacity(ceiling);
        for _ in 0..ceiling {
            fibers.push(Fiber::create());
        }
        while let Some(fiber) = fibers.pop() {
            Fiber::destroy(fiber);
        }
    }

    /// Current fiber usage counters.
    pub fn statistics() -> Statistics {
        let cached = global::try_global_state()
            .map(|gs| gs.fiber_cache.borrow().len())
            .unwrap_or(0);
        COUNTERS.with(|c| Statistics {
            total: c.total.get(),
            current: c.current.get(),
            cached,
            max: c.max.get(),
        })
    }

    /// Drop the cache and reset all counters.
    pub fn reset() {
        if let Some(gs) = global::try_global_state() {
            gs.fiber_cache.borrow_mut().clear();
        }
        COUNTERS.with(|c| {
            c.total.set(0);
            c.current.set(0);
            c.max.set(0);
        });
    }

    /// Drive one resume slice: restore the save buffer onto the shared
    /// stack, call the task, and on yield copy the live window back aside.
    fn run_slice(&mut self) -> HResult<()> {
        debug_assert!(
            matches!(self.state, FiberState::Fresh | FiberState::Suspended),
            "fiber {} resumed in state {}", self.id, self.state.as_str()
        );

        let gs = global::global_state();

        // Materialize this fiber's window on top of the shared stack. The
        // borrow must not be held across the task call: the task may
        // re-enter the executor.
        let base = {
            let mut stack = gs.shared_stack.borrow_mut();
            let base = stack.words.len();
            stack.words.extend_from_slice(&self.save);
            base
        };
        self.save.clear();
        self.state = FiberState::Running;
        rt_debug!("fibers", "[{}] running on shared stack at base {}", self.id, base);

        let window = StackWindow {
            gs: gs.clone(),
            base,
        };

        let id = self.id;
        let task = self
            .task
            .as_mut()
            .ok_or_else(|| HError::fiber_internal("resume without task"))?;

        let prev = context::with_current(|ctx| ctx.swap_running_fiber(Some(id)));
        let step = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(&window)))
            .unwrap_or_else(|_| Step::Done(Err(HError::generic("unhandled panic in fiber task"))));
        context::with_current(|ctx| ctx.swap_running_fiber(prev));

        let mut stack = gs.shared_stack.borrow_mut();
        if stack.words.len() < base {
            self.state = FiberState::Done;
            return Err(HError::fiber_internal("shared stack underflow"));
        }

        match step {
            Step::Yield => {
                self.save = stack.words.drain(base..).collect();
                self.state = FiberState::Suspended;
                rt_debug!("fibers", "[{}] yielded, saved {} words", self.id, self.save.len());
            }
            Step::Done(result) => {
                stack.words.truncate(base);
                self.task = None;
                self.result = Some(result);
                self.state = FiberState::Done;
                rt_debug!("fibers", "[{}] finished", self.id);
            }
        }
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let _ = COUNTERS.try_with(|c| c.current.set(c.current.get().saturating_sub(1)));
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<fiber:{} saved={}>", self.state.as_str(), self.save.len())
    }
}

// ---------------------------------------------------------------------------
// Resumable
// ---------------------------------------------------------------------------

/// Executor handle for one unit of work running on a fiber.
///
/// `run()` starts the task; while it keeps yielding, `resume()` continues
/// it. Once the fiber finishes, its result is held here and the fiber goes
/// back to the cache. Dropping a `Resumable` that is still suspended
/// abandons the fiber; its save buffer is discarded.
pub struct Resumable {
    fiber: Option<Box<Fiber>>,
    result: Option<Box<dyn Any>>,
    done: bool,
}

impl Resumable {
    pub fn new(task: Task) -> Self {
        let mut fiber = Fiber::create();
        fiber.install(task);
        Resumable {
            fiber: Some(fiber),
            result: None,
            done: false,
        }
    }

    /// Start the task. Returns after the first yield or completion.
    pub fn run(&mut self) -> HResult<()> {
        let fiber = self.check_fiber("run")?;
        debug_assert!(fiber.state() == FiberState::Fresh, "run on a started fiber");
        fiber.run_slice()?;
        self.yielded()
    }

    /// Continue a suspended task. Returns after the next yield or
    /// completion.
    pub fn resume(&mut self) -> HResult<()> {
        let fiber = self.check_fiber("resume")?;
        debug_assert!(
            fiber.state() == FiberState::Suspended,
            "resume on a fiber that is not suspended"
        );
        fiber.run_slice()?;
        self.yielded()
    }

    /// Abandon the task: the fiber is never resumed again and its save
    /// buffer is discarded.
    pub fn abort(&mut self) {
        if let Some(fiber) = self.fiber.take() {
            Fiber::destroy(fiber);
        }
        self.result = None;
        self.done = true;
    }

    /// True once the task has completed (or was aborted).
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The completed task's result, if any. Consumes the stored value.
    pub fn take_result(&mut self) -> Option<Box<dyn Any>> {
        self.result.take()
    }

    fn check_fiber(&mut self, op: &str) -> HResult<&mut Fiber> {
        match self.fiber.as_deref_mut() {
            Some(fiber) => Ok(fiber),
            None => Err(HError::fiber_internal(format!("fiber not set in {}", op))),
        }
    }

    /// Post-slice bookkeeping: on completion take the result (or surface
    /// the error) and recycle the fiber.
    fn yielded(&mut self) -> HResult<()> {
        let finished = self.fiber.as_ref().map(|f| f.is_done()).unwrap_or(false);
        if !finished {
            return Ok(());
        }

        let mut fiber = self.fiber.take().expect("finished fiber present");
        let result = fiber
            .result
            .take()
            .ok_or_else(|| HError::fiber_internal("fiber finished without result"))?;
        self.done = true;
        Fiber::destroy(fiber);

        match result {
            Ok(value) => {
                self.result = Some(value);
                Ok(())
            }
            Err(err) => {
                if crate::error::abort_on_error_enabled() {
                    crate::error::report_fatal(&err);
                }
                Err(err)
            }
        }
    }
}

impl Drop for Resumable {
    fn drop(&mut self) {
        if let Some(fiber) = self.fiber.take() {
            Fiber::destroy(fiber);
        }
    }
}

/// Run a task on a fiber and drive it to completion.
pub fn execute(task: Task) -> TaskResult {
    let mut resumable = Resumable::new(task);
    resumable.run()?;
    while !resumable.is_done() {
        resumable.resume()?;
    }
    resumable
        .take_result()
        .ok_or_else(|| HError::fiber_internal("task completed without result"))
}
