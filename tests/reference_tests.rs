//! End-to-end scenarios for the reference trio.

use std::ptr;

use hilti::reference::Control;
use hilti::{Controllable, StrongReference, ValueReference, WeakReference};

#[derive(Debug, Default, Clone, PartialEq)]
struct Item {
    x: i64,
    control: Control<Item>,
}

impl Item {
    fn new(x: i64) -> Self {
        Item {
            x,
            ..Default::default()
        }
    }

    /// Method-style dispatch: rebuild a usable reference from `self`.
    fn tag_through_self(&mut self, value: i64) {
        let this = ValueReference::self_of(self as *mut Item);
        this.deref_mut().unwrap().x = value;
    }
}

impl Controllable for Item {
    fn control(&self) -> Option<&Control<Self>> {
        Some(&self.control)
    }
}

#[test]
fn default_value_reference_holds_default_value() {
    let r = ValueReference::<i64>::default();
    assert!(!r.is_null());
    assert_eq!(*r.deref().unwrap(), 0);
}

#[test]
fn value_round_trip() {
    for v in [-5i64, 0, 1, 42, i64::MAX] {
        let r = ValueReference::new(v);
        assert_eq!(*r.deref().unwrap(), v);
    }
}

#[test]
fn null_self_view() {
    let r = ValueReference::<Item>::self_of(ptr::null_mut());
    assert!(r.is_null());
    let err = r.deref().expect_err("deref of null view");
    assert_eq!(err.description(), "attempt to access null reference");
}

#[test]
fn method_rebuilds_reference_from_self() {
    let owner = ValueReference::new(Item::new(0));
    unsafe { &mut *owner.get() }.tag_through_self(42);
    assert_eq!(owner.deref().unwrap().x, 42);
}

#[test]
fn strong_from_stack_view_fails() {
    let mut x = Item::new(1);
    let view = ValueReference::self_of(&mut x);
    let err = StrongReference::from_value(&view).expect_err("stack instance");
    assert_eq!(err.description(), "reference to non-heap instance");

    let err = WeakReference::from_value(&view).expect_err("stack instance");
    assert_eq!(err.description(), "reference to non-heap instance");
}

#[test]
fn copy_has_distinct_storage() {
    let a = ValueReference::new(Item::new(5));
    let b = a.clone();
    assert_eq!(a, b);
    assert_ne!(a.get(), b.get());

    // Mutating the copy leaves the original alone.
    b.deref_mut().unwrap().x = 6;
    assert_eq!(a.deref().unwrap().x, 5);
    assert_eq!(b.deref().unwrap().x, 6);
}

#[test]
fn strong_shares_not_copies() {
    let v = ValueReference::new(42i64);
    let s = StrongReference::from_value(&v).unwrap();
    assert_eq!(s.get(), v.get());
}

#[test]
fn weak_expiration_lifecycle() {
    let mut s = StrongReference::new(42i64);
    let w = WeakReference::from_strong(&s);
    assert!(!w.is_expired());
    assert!(!w.is_null());

    s.reset();
    assert!(w.is_expired());
    assert!(w.get().is_null());
    assert!(w.deref_as_value().is_null());
}

#[test]
fn default_weak_is_null_not_expired() {
    let w = WeakReference::<i64>::default();
    assert!(w.is_null());
    assert!(!w.is_expired());
}

// Cyclic structure: a parent owning its child through a value reference,
// the child observing the parent through a weak back-edge.

#[derive(Debug, Default, Clone, PartialEq)]
struct Parent {
    child: Option<ValueReference<Child>>,
    control: Control<Parent>,
}

impl Controllable for Parent {
    fn control(&self) -> Option<&Control<Self>> {
        Some(&self.control)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Child {
    parent: WeakReference<Parent>,
    control: Control<Child>,
}

impl Controllable for Child {
    fn control(&self) -> Option<&Control<Self>> {
        Some(&self.control)
    }
}

#[test]
fn cycle_with_weak_back_edge() {
    let child_probe;
    {
        let parent = ValueReference::<Parent>::default();
        let child = ValueReference::<Child>::default();

        // Wire the cycle through a self view, the way method bodies do.
        let parent_view = ValueReference::self_of(parent.get());
        child.deref_mut().unwrap().parent = WeakReference::from_value(&parent_view).unwrap();
        parent.deref_mut().unwrap().child = Some(child.clone());

        // The back edge resolves while the parent is alive.
        let back = child.deref().unwrap().parent.clone();
        assert!(!back.is_expired());
        assert_eq!(back.get(), parent.get());

        child_probe = child.deref().unwrap().parent.clone();
        // Parent and child drop here; the weak edge breaks the cycle.
    }

    // Reading the back edge after the parent is gone is safe: expired, not
    // dangling.
    assert!(child_probe.is_expired());
    assert!(child_probe.get().is_null());
    assert!(child_probe.deref_as_value().is_null());
}

#[test]
fn strong_reference_keeps_cycle_member_alive() {
    let keeper;
    {
        let parent = ValueReference::<Parent>::default();
        keeper = StrongReference::from_value(&parent).unwrap();
    }
    // The value reference is gone; the strong reference still owns.
    assert!(!keeper.is_null());
    assert!(keeper.deref().unwrap().child.is_none());
}
