//! End-to-end scenarios for the fiber executor and cache.

use hilti::fiber::{Fiber, StackWord};
use hilti::{execute, Resumable, Step};

/// A task that yields `yields` times, counting on its stack window, then
/// returns `value`.
fn yielding_task(yields: usize, value: i64) -> hilti::fiber::Task {
    let mut started = false;
    Box::new(move |stack| {
        if !started {
            started = true;
            stack.push(0);
        }
        let done = stack.get(0) as usize;
        if done < yields {
            stack.set(0, (done + 1) as StackWord);
            Step::Yield
        } else {
            stack.pop();
            Step::Done(Ok(Box::new(value)))
        }
    })
}

#[test]
fn every_scheduled_task_completes() {
    hilti::init();
    for i in 0..100i64 {
        let result = execute(yielding_task((i % 7) as usize, i)).unwrap();
        assert_eq!(*result.downcast::<i64>().unwrap(), i);
    }
    hilti::done();
}

#[test]
fn cache_stays_within_ceiling() {
    hilti::done();
    Fiber::reset();
    {
        let gs = hilti::global_state();
        gs.configuration.borrow_mut().fiber_cache_size = 5;
    }

    // Run far more concurrent tasks than the ceiling allows.
    let mut live: Vec<Resumable> = (0..32)
        .map(|i| {
            let mut r = Resumable::new(yielding_task(2, i));
            r.run().unwrap();
            r
        })
        .collect();
    for r in &mut live {
        while !r.is_done() {
            r.resume().unwrap();
        }
    }

    let stats = Fiber::statistics();
    assert!(stats.cached <= 5, "cache grew to {}", stats.cached);
    assert!(stats.total >= 32);

    hilti::done();
    Fiber::reset();
}

#[test]
fn interleaved_fibers_keep_state_apart() {
    let mut a = Resumable::new(yielding_task(3, 10));
    let mut b = Resumable::new(yielding_task(3, 20));

    a.run().unwrap();
    b.run().unwrap();
    while !a.is_done() || !b.is_done() {
        if !a.is_done() {
            a.resume().unwrap();
        }
        if !b.is_done() {
            b.resume().unwrap();
        }
    }

    assert_eq!(*a.take_result().unwrap().downcast::<i64>().unwrap(), 10);
    assert_eq!(*b.take_result().unwrap().downcast::<i64>().unwrap(), 20);
}

#[test]
fn nested_execution_from_running_task() {
    let result = execute(Box::new(|stack| {
        stack.push(1);
        // Re-entrant run: the inner unit draws its own fiber.
        let inner = execute(yielding_task(2, 2)).unwrap();
        let inner = *inner.downcast::<i64>().unwrap();
        let outer = stack.pop().unwrap() as i64;
        Step::Done(Ok(Box::new(outer + inner)))
    }))
    .unwrap();
    assert_eq!(*result.downcast::<i64>().unwrap(), 3);
}

#[test]
fn abandoned_task_is_cancelled_not_leaked() {
    hilti::done();
    Fiber::reset();

    {
        let mut r = Resumable::new(yielding_task(100, 0));
        r.run().unwrap();
        assert!(!r.is_done());
        // Dropped without ever being resumed again.
    }

    // The fiber went back to the pool with an empty task slot, and the
    // shared stack holds nothing of it.
    let stats = Fiber::statistics();
    assert_eq!(stats.cached, 1);
    assert_eq!(hilti::global_state().shared_stack.borrow().depth(), 0);

    hilti::done();
    Fiber::reset();
}

#[test]
fn task_error_reaches_the_caller() {
    let result = execute(Box::new(|_stack| {
        Step::Done(Err(hilti::HError::generic("deliberate failure")))
    }));
    let err = result.expect_err("task failed");
    assert!(err.description().contains("deliberate failure"));
}

#[test]
fn errors_do_not_poison_the_executor() {
    let _ = execute(Box::new(|_stack| {
        Step::Done(Err(hilti::HError::generic("first task fails")))
    }));

    let ok = execute(Box::new(|_stack| Step::Done(Ok(Box::new(7i64))))).unwrap();
    assert_eq!(*ok.downcast::<i64>().unwrap(), 7);
}

#[test]
fn statistics_track_reuse() {
    hilti::done();
    Fiber::reset();

    let _ = execute(yielding_task(1, 0));
    let after_first = Fiber::statistics();
    assert_eq!(after_first.total, 1);
    assert_eq!(after_first.cached, 1);

    let _ = execute(yielding_task(1, 0));
    let after_second = Fiber::statistics();
    // The second run reused the cached fiber.
    assert_eq!(after_second.total, 1);

    hilti::done();
    Fiber::reset();
}

#[test]
fn prime_cache_prepares_fibers_up_front() {
    hilti::done();
    Fiber::reset();
    {
        let gs = hilti::global_state();
        gs.configuration.borrow_mut().fiber_cache_size = 3;
    }

    Fiber::prime_cache();
    assert_eq!(Fiber::statistics().cached, 3);

    // Running work now allocates nothing new.
    let total = Fiber::statistics().total;
    let _ = execute(yielding_task(1, 0));
    assert_eq!(Fiber::statistics().total, total);

    hilti::done();
    Fiber::reset();
}
