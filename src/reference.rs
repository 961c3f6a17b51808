//! Value, strong, and weak references over runtime values.
//!
//! Generated code manipulates runtime values through three reference
//! flavors with a precise ownership contract:
//!
//! - [`ValueReference<T>`] is a *value* with a stable address. It normally
//!   owns a heap-allocated `T`, and copying it copies the `T` into a fresh
//!   heap allocation, mirroring `T`'s value semantics. It can also be a
//!   non-owning view onto an instance whose storage lives elsewhere,
//!   reconstructed from a raw `self` pointer inside a method body.
//! - [`StrongReference<T>`] is an explicitly owning handle: the referent is
//!   heap-resident and stays alive as long as any strong reference observes
//!   it. Copying shares.
//! - [`WeakReference<T>`] observes without owning, and distinguishes three
//!   states: null (never bound), live, and expired (bound, then released).
//!
//! Heap residency is `Rc<RefCell<T>>`; a view is a raw pointer. Types that
//! want `self`-reconstruction opt into the [`Controllable`] protocol by
//! embedding a [`Control`] slot, which every heap-allocating constructor
//! wires to the owning allocation. Cyclic data is expressed by making at
//! least one edge of each ownership cycle weak; the runtime does not
//! enforce this, generated code maintains it.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::ptr;
use std::rc::{Rc, Weak};

use crate::error::{HError, HResult};

// ---------------------------------------------------------------------------
// Controllable protocol
// ---------------------------------------------------------------------------

/// Embedded control slot allowing references to be reconstructed from a raw
/// instance pointer. Holds a weak handle to the owning heap allocation;
/// empty for instances that live outside the runtime heap.
pub struct Control<T> {
    slot: RefCell<Weak<RefCell<T>>>,
}

impl<T> Control<T> {
    pub fn new() -> Self {
        Control {
            slot: RefCell::new(Weak::new()),
        }
    }

    fn bind(&self, weak: Weak<RefCell<T>>) {
        *self.slot.borrow_mut() = weak;
    }

    fn upgrade(&self) -> Option<Rc<RefCell<T>>> {
        self.slot.borrow().upgrade()
    }
}

impl<T> Default for Control<T> {
    fn default() -> Self {
        Self::new()
    }
}

// A copied instance is a new instance; its slot is wired when (and if) the
// copy lands on the heap.
impl<T> Clone for Control<T> {
    fn clone(&self) -> Self {
        Control::new()
    }
}

impl<T> fmt::Debug for Control<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<control>")
    }
}

// The slot never participates in value identity.
impl<T> PartialEq for Control<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for Control<T> {}

/// Protocol for types participating in the reference system.
///
/// A type either opts into control by embedding a [`Control`] slot and
/// returning it here, which enables [`ValueReference::self_of`] and
/// conversion of heap-resident views into owning references, or it is a
/// plain payload and keeps the default.
pub trait Controllable: Sized {
    /// The instance's embedded control slot, if the type carries one.
    fn control(&self) -> Option<&Control<Self>> {
        None
    }
}

macro_rules! plain_payload {
    ($($t:ty),* $(,)?) => {
        $(impl Controllable for $t {})*
    };
}

plain_payload!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, isize, usize);
plain_payload!(f32, f64, bool, char, String, ());

/// Heap-allocate a value and wire its control slot, if it has one.
fn alloc<T: Controllable>(value: T) -> Rc<RefCell<T>> {
    let rc = Rc::new(RefCell::new(value));
    {
        let inner = rc.borrow();
        if let Some(control) = inner.control() {
            control.bind(Rc::downgrade(&rc));
        }
    }
    rc
}

// ---------------------------------------------------------------------------
// Borrow guards
// ---------------------------------------------------------------------------

/// Shared borrow of a referent, independent of where it lives.
pub struct Borrowed<'a, T> {
    inner: BorrowedInner<'a, T>,
}

enum BorrowedInner<'a, T> {
    Cell(Ref<'a, T>),
    Raw(&'a T),
}

impl<T> std::ops::Deref for Borrowed<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            BorrowedInner::Cell(r) => r,
            BorrowedInner::Raw(r) => r,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Borrowed<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive borrow of a referent, independent of where it lives.
pub struct BorrowedMut<'a, T> {
    inner: BorrowedMutInner<'a, T>,
}

enum BorrowedMutInner<'a, T> {
    Cell(RefMut<'a, T>),
    Raw(&'a mut T),
}

impl<T> std::ops::Deref for BorrowedMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            BorrowedMutInner::Cell(r) => r,
            BorrowedMutInner::Raw(r) => r,
        }
    }
}

impl<T> std::ops::DerefMut for BorrowedMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            BorrowedMutInner::Cell(r) => r,
            BorrowedMutInner::Raw(r) => r,
        }
    }
}

// ---------------------------------------------------------------------------
// ValueReference
// ---------------------------------------------------------------------------

enum Place<T> {
    /// Co-owned heap allocation. Never null.
    Heap(Rc<RefCell<T>>),
    /// Non-owning view; a null pointer is the null state.
    View(*mut T),
}

/// Nominally-owning reference with value semantics.
pub struct ValueReference<T> {
    place: Place<T>,
}

impl<T: Controllable> ValueReference<T> {
    /// Owns a new heap allocation holding `value`.
    pub fn new(value: T) -> Self {
        ValueReference {
            place: Place::Heap(alloc(value)),
        }
    }

    /// Co-owns an existing heap allocation.
    pub fn from_shared(ptr: Rc<RefCell<T>>) -> Self {
        {
            let inner = ptr.borrow();
            if let Some(control) = inner.control() {
                control.bind(Rc::downgrade(&ptr));
            }
        }
        ValueReference {
            place: Place::Heap(ptr),
        }
    }

    /// Reconstruct a non-owning view from a raw `self` pointer inside a
    /// method body. A null pointer yields a null reference; dereferencing
    /// it fails later with `NullReference`.
    pub fn self_of(this: *mut T) -> Self {
        ValueReference {
            place: Place::View(this),
        }
    }

    /// Shared-ownership handle to the referent.
    ///
    /// Succeeds when this reference owns heap storage, or when it is a view
    /// onto a heap-resident instance whose control slot is wired. A view of
    /// a non-heap instance has no owning allocation to share.
    pub fn as_shared(&self) -> HResult<Rc<RefCell<T>>> {
        match &self.place {
            Place::Heap(rc) => Ok(rc.clone()),
            Place::View(p) if p.is_null() => {
                Err(HError::illegal_reference("unexpected state of value reference"))
            }
            Place::View(p) => {
                // Safety: a non-null view is only constructed from a live
                // instance by generated code, which guarantees the instance
                // outlives the view; execution is single-threaded.
                let instance = unsafe { &**p };
                instance
                    .control()
                    .and_then(|c| c.upgrade())
                    .ok_or_else(|| HError::illegal_reference("reference to non-heap instance"))
            }
        }
    }
}

impl<T> ValueReference<T> {
    /// Raw pointer to the referent; null for a null reference.
    pub fn get(&self) -> *mut T {
        match &self.place {
            Place::Heap(rc) => rc.as_ptr(),
            Place::View(p) => *p,
        }
    }

    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    /// Becomes a null reference; drops co-ownership if any.
    pub fn reset(&mut self) {
        self.place = Place::View(ptr::null_mut());
    }

    /// Borrow the referent.
    pub fn deref(&self) -> HResult<Borrowed<'_, T>> {
        match &self.place {
            Place::Heap(rc) => Ok(Borrowed {
                inner: BorrowedInner::Cell(rc.borrow()),
            }),
            Place::View(p) if p.is_null() => Err(HError::null_reference()),
            Place::View(p) => Ok(Borrowed {
                // Safety: see `as_shared`.
                inner: BorrowedInner::Raw(unsafe { &**p }),
            }),
        }
    }

    /// Borrow the referent mutably.
    pub fn deref_mut(&self) -> HResult<BorrowedMut<'_, T>> {
        match &self.place {
            Place::Heap(rc) => Ok(BorrowedMut {
                inner: BorrowedMutInner::Cell(rc.borrow_mut()),
            }),
            Place::View(p) if p.is_null() => Err(HError::null_reference()),
            Place::View(p) => Ok(BorrowedMut {
                // Safety: see `as_shared`.
                inner: BorrowedMutInner::Raw(unsafe { &mut **p }),
            }),
        }
    }

    /// Replace the referent's value in place. Does not re-point the
    /// reference.
    pub fn assign(&self, value: T) -> HResult<()> {
        *self.deref_mut()? = value;
        Ok(())
    }
}

impl<T: Controllable + Default> Default for ValueReference<T> {
    /// A default reference owns a fresh heap `T` in its default state; it
    /// is not null.
    fn default() -> Self {
        ValueReference::new(T::default())
    }
}

// Copying a value reference copies the value: the copy owns a fresh heap
// allocation, so two references that compare equal still have distinct
// storage.
impl<T: Controllable + Clone> Clone for ValueReference<T> {
    fn clone(&self) -> Self {
        match self.deref() {
            Ok(value) => ValueReference::new(value.clone()),
            Err(_) => ValueReference {
                place: Place::View(ptr::null_mut()),
            },
        }
    }
}

impl<T: PartialEq> PartialEq for ValueReference<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.deref(), other.deref()) {
            (Ok(a), Ok(b)) => *a == *b,
            (Err(_), Err(_)) => true,
            _ => false,
        }
    }
}

impl<T: PartialEq> PartialEq<T> for ValueReference<T> {
    fn eq(&self, other: &T) -> bool {
        match self.deref() {
            Ok(value) => *value == *other,
            Err(_) => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.deref() {
            Ok(value) => write!(f, "<value-ref {:?}>", &*value),
            Err(_) => write!(f, "<value-ref null>"),
        }
    }
}

// ---------------------------------------------------------------------------
// StrongReference
// ---------------------------------------------------------------------------

/// Explicitly-owning reference. The referent is heap-resident and kept
/// alive as long as any strong reference observes it. Copying shares.
pub struct StrongReference<T> {
    inner: Option<Rc<RefCell<T>>>,
}

impl<T: Controllable> StrongReference<T> {
    /// Owns a new heap allocation holding `value`.
    pub fn new(value: T) -> Self {
        StrongReference {
            inner: Some(alloc(value)),
        }
    }

    /// Share ownership with a value reference.
    ///
    /// A null value reference yields a null strong reference. A view of a
    /// non-heap instance fails with `IllegalReference`: such instances have
    /// no shared control block.
    pub fn from_value(value: &ValueReference<T>) -> HResult<Self> {
        if value.is_null() {
            return Ok(StrongReference { inner: None });
        }
        Ok(StrongReference {
            inner: Some(value.as_shared()?),
        })
    }

    /// Replace the referent's value, allocating when currently null.
    pub fn assign(&mut self, value: T) {
        match &self.inner {
            Some(rc) => *rc.borrow_mut() = value,
            None => self.inner = Some(alloc(value)),
        }
    }
}

impl<T> StrongReference<T> {
    /// A null strong reference.
    pub fn null() -> Self {
        StrongReference { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Raw pointer to the referent; null when unset.
    pub fn get(&self) -> *mut T {
        match &self.inner {
            Some(rc) => rc.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    /// Drop ownership; becomes null. Other owners are unaffected.
    pub fn reset(&mut self) {
        self.inner = None;
    }

    /// Borrow the referent.
    pub fn deref(&self) -> HResult<Borrowed<'_, T>> {
        match &self.inner {
            Some(rc) => Ok(Borrowed {
                inner: BorrowedInner::Cell(rc.borrow()),
            }),
            None => Err(HError::null_reference()),
        }
    }

    /// Borrow the referent mutably.
    pub fn deref_mut(&self) -> HResult<BorrowedMut<'_, T>> {
        match &self.inner {
            Some(rc) => Ok(BorrowedMut {
                inner: BorrowedMutInner::Cell(rc.borrow_mut()),
            }),
            None => Err(HError::null_reference()),
        }
    }

    /// A value reference sharing this reference's storage (no copy). Null
    /// when this reference is null.
    pub fn deref_as_value(&self) -> ValueReference<T> {
        match &self.inner {
            Some(rc) => ValueReference {
                place: Place::Heap(rc.clone()),
            },
            None => ValueReference {
                place: Place::View(ptr::null_mut()),
            },
        }
    }
}

impl<T> Default for StrongReference<T> {
    fn default() -> Self {
        StrongReference::null()
    }
}

// Copying a strong reference shares the referent.
impl<T> Clone for StrongReference<T> {
    fn clone(&self) -> Self {
        StrongReference {
            inner: self.inner.clone(),
        }
    }
}

impl<T: PartialEq> PartialEq for StrongReference<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.deref(), other.deref()) {
            (Ok(a), Ok(b)) => *a == *b,
            (Err(_), Err(_)) => true,
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StrongReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.deref() {
            Ok(value) => write!(f, "<strong-ref {:?}>", &*value),
            Err(_) => write!(f, "<strong-ref null>"),
        }
    }
}

// ---------------------------------------------------------------------------
// WeakReference
// ---------------------------------------------------------------------------

enum WeakPlace<T> {
    /// Never bound to a referent.
    Null,
    /// Bound; the referent may since have been released.
    Bound(Weak<RefCell<T>>),
}

/// Non-owning observer of a heap-resident value.
///
/// Distinguishes `null` (never bound) from `expired` (bound while the
/// referent was alive, released since). There is no transition back from
/// expired.
pub struct WeakReference<T> {
    place: WeakPlace<T>,
}

impl<T> WeakReference<T> {
    /// A null weak reference; never bound.
    pub fn new() -> Self {
        WeakReference {
            place: WeakPlace::Null,
        }
    }

    /// Observe the referent of a strong reference. A null strong reference
    /// leaves the weak reference null.
    pub fn from_strong(strong: &StrongReference<T>) -> Self {
        match &strong.inner {
            Some(rc) => WeakReference {
                place: WeakPlace::Bound(Rc::downgrade(rc)),
            },
            None => WeakReference::new(),
        }
    }

    /// True when no live referent can be produced (never bound, or
    /// expired).
    pub fn is_null(&self) -> bool {
        match &self.place {
            WeakPlace::Null => true,
            WeakPlace::Bound(weak) => weak.strong_count() == 0,
        }
    }

    /// True only for the bound-then-released state. A default-constructed
    /// weak reference is null, not expired.
    pub fn is_expired(&self) -> bool {
        match &self.place {
            WeakPlace::Null => false,
            WeakPlace::Bound(weak) => weak.strong_count() == 0,
        }
    }

    /// Raw pointer to the referent; null in both the null and the expired
    /// state.
    pub fn get(&self) -> *mut T {
        match &self.place {
            WeakPlace::Null => ptr::null_mut(),
            WeakPlace::Bound(weak) => match weak.upgrade() {
                Some(rc) => rc.as_ptr(),
                None => ptr::null_mut(),
            },
        }
    }

    /// A value reference sharing the observed storage; a null value
    /// reference when this reference is null or expired.
    pub fn deref_as_value(&self) -> ValueReference<T> {
        match &self.place {
            WeakPlace::Bound(weak) => match weak.upgrade() {
                Some(rc) => ValueReference {
                    place: Place::Heap(rc),
                },
                None => ValueReference {
                    place: Place::View(ptr::null_mut()),
                },
            },
            WeakPlace::Null => ValueReference {
                place: Place::View(ptr::null_mut()),
            },
        }
    }
}

impl<T: Controllable> WeakReference<T> {
    /// Observe the referent of a heap-backed value reference.
    ///
    /// A null value reference leaves the weak reference null; a view of a
    /// non-heap instance fails with `IllegalReference`.
    pub fn from_value(value: &ValueReference<T>) -> HResult<Self> {
        if value.is_null() {
            return Ok(WeakReference::new());
        }
        Ok(WeakReference {
            place: WeakPlace::Bound(Rc::downgrade(&value.as_shared()?)),
        })
    }
}

impl<T> Default for WeakReference<T> {
    fn default() -> Self {
        WeakReference::new()
    }
}

impl<T> Clone for WeakReference<T> {
    fn clone(&self) -> Self {
        WeakReference {
            place: match &self.place {
                WeakPlace::Null => WeakPlace::Null,
                WeakPlace::Bound(weak) => WeakPlace::Bound(weak.clone()),
            },
        }
    }
}

impl<T: PartialEq> PartialEq for WeakReference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deref_as_value() == other.deref_as_value()
    }
}

impl<T> fmt::Debug for WeakReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.place {
            WeakPlace::Null => "null",
            WeakPlace::Bound(weak) if weak.strong_count() == 0 => "expired",
            WeakPlace::Bound(_) => "live",
        };
        write!(f, "<weak-ref {}>", state)
    }
}
