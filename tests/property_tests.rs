// Property-based tests for the reference trio and the fiber executor,
// using generated inputs to exercise edge cases that example-based tests
// miss.

use proptest::prelude::*;

use hilti::fiber::{Fiber, StackWord, Task};
use hilti::{execute, Resumable, Step, StrongReference, ValueReference, WeakReference};

// ============================================================================
// Property 1: Value references round-trip arbitrary payloads.
// ============================================================================

proptest! {
    #[test]
    fn value_reference_round_trip(v in any::<i64>()) {
        let r = ValueReference::new(v);
        prop_assert!(!r.is_null());
        prop_assert_eq!(*r.deref().unwrap(), v);
    }

    #[test]
    fn value_reference_assign_overwrites(a in any::<i64>(), b in any::<i64>()) {
        let r = ValueReference::new(a);
        let addr = r.get();
        r.assign(b).unwrap();
        prop_assert_eq!(*r.deref().unwrap(), b);
        // Assignment replaces the value, never the storage.
        prop_assert_eq!(r.get(), addr);
    }
}

// ============================================================================
// Property 2: Copies are equal but never share storage.
// ============================================================================

proptest! {
    #[test]
    fn copies_are_deep(v in any::<i64>(), edits in proptest::collection::vec(any::<i64>(), 0..8)) {
        let original = ValueReference::new(v);
        let copy = original.clone();

        prop_assert_eq!(&original, &copy);
        prop_assert_ne!(original.get(), copy.get());

        // However the copy is edited, the original holds its value.
        for e in edits {
            copy.assign(e).unwrap();
        }
        prop_assert_eq!(*original.deref().unwrap(), v);
    }
}

// ============================================================================
// Property 3: Weak observers agree with the owners' lifetimes under any
// interleaving of clones and resets.
// ============================================================================

proptest! {
    #[test]
    fn weak_observers_track_ownership(clones in 1usize..6, v in any::<i64>()) {
        let first = StrongReference::new(v);
        let weak = WeakReference::from_strong(&first);
        let mut owners: Vec<StrongReference<i64>> =
            (0..clones).map(|_| first.clone()).collect();
        let mut first = Some(first);

        // Release owners one at a time, in creation order.
        while first.is_some() || !owners.is_empty() {
            prop_assert!(!weak.is_expired());
            prop_assert_eq!(*weak.deref_as_value().deref().unwrap(), v);

            if first.take().is_none() {
                owners.pop();
            }
        }

        prop_assert!(weak.is_expired());
        prop_assert!(weak.get().is_null());
        prop_assert!(weak.deref_as_value().is_null());
    }
}

// ============================================================================
// Property 4: For any yield schedule, a fiber produces its result exactly
// once and the shared stack ends balanced.
// ============================================================================

fn counting_task(yields: usize, value: i64) -> Task {
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

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fiber_completes_for_any_yield_count(yields in 0usize..32, v in any::<i64>()) {
        let mut r = Resumable::new(counting_task(yields, v));
        r.run().unwrap();

        let mut resumes = 0usize;
        while !r.is_done() {
            r.resume().unwrap();
            resumes += 1;
        }
        prop_assert_eq!(resumes, yields);
        prop_assert_eq!(*r.take_result().unwrap().downcast::<i64>().unwrap(), v);
        prop_assert_eq!(hilti::global_state().shared_stack.borrow().depth(), 0);
    }

    #[test]
    fn executor_handles_any_batch(tasks in proptest::collection::vec((0usize..8, any::<i64>()), 1..16)) {
        for (yields, v) in tasks {
            let result = execute(counting_task(yields, v)).unwrap();
            prop_assert_eq!(*result.downcast::<i64>().unwrap(), v);
        }
    }
}

// ============================================================================
// Property 5: The fiber cache never exceeds its ceiling, whatever the load.
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn cache_bound_holds_under_load(
        ceiling in 1usize..8,
        concurrent in 1usize..24,
    ) {
        hilti::done();
        Fiber::reset();
        {
            let gs = hilti::global_state();
            gs.configuration.borrow_mut().fiber_cache_size = ceiling;
        }

        let mut live: Vec<Resumable> = (0..concurrent)
            .map(|i| {
                let mut r = Resumable::new(counting_task(1, i as i64));
                r.run().unwrap();
                r
            })
            .collect();
        prop_assert!(Fiber::statistics().cached <= ceiling);

        for r in &mut live {
            while !r.is_done() {
                r.resume().unwrap();
            }
        }
        prop_assert!(Fiber::statistics().cached <= ceiling);

        hilti::done();
        Fiber::reset();
    }
}
