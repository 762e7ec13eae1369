//! Fixed-capacity binary max-heap used for eviction-candidate selection.
//!
//! The heap is array-backed, never resizes, and takes its ordering from an
//! injected comparator rather than `Ord`, so the same type can back both
//! "oldest first" and "largest first" selections.
//!
//! # Properties
//!
//! - Max-heap invariant: while consistent, no parent compares `Less` than
//!   either of its children.
//! - Bounded reservoir: [`EvictionHeap::try_insert`] keeps the `capacity`
//!   smallest elements (per comparator) among all elements ever offered.
//!   This is how an eviction scan over an arbitrarily large table selects
//!   its N candidates in O(N) memory.
//! - Capacity exhaustion is a signal ([`HeapFull`], [`TryInsert::Rejected`]),
//!   never an error.
//!
//! # Example
//!
//! ```
//! use plancache::heap::{EvictionHeap, TryInsert};
//!
//! // Keep the two smallest integers seen during a scan.
//! let mut heap = EvictionHeap::with_capacity(2, i64::cmp);
//! assert!(matches!(heap.try_insert(5), TryInsert::Accepted));
//! assert!(matches!(heap.try_insert(3), TryInsert::Accepted));
//! assert!(matches!(heap.try_insert(9), TryInsert::Rejected(9)));
//! assert!(matches!(heap.try_insert(1), TryInsert::Replaced(5)));
//! ```

use std::cmp::Ordering;

/// Three-way comparator injected into the heap.
///
/// Blanket-implemented for closures, so `EvictionHeap::with_capacity(n,
/// |a, b| ...)` works without a named type.
pub trait Compare<T> {
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

impl<T, F> Compare<T> for F
where
    F: Fn(&T, &T) -> Ordering,
{
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// Structural state of the heap.
///
/// `add` leaves the buffer unordered (`Inconsistent`) until `build` runs;
/// `sort` leaves the buffer in ascending order (`Sorted`), which also does
/// not satisfy the max-heap invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapState {
    Inconsistent,
    Consistent,
    Sorted,
}

/// Signal returned when an `add` or `insert` hits capacity.
///
/// Expected and recoverable: callers branch on it, they do not propagate it
/// as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapFull;

/// Outcome of a bounded [`EvictionHeap::try_insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryInsert<T> {
    /// Under capacity; the element was inserted.
    Accepted,
    /// At capacity and the element compares >= the current maximum;
    /// the heap is unchanged and the element is handed back.
    Rejected(T),
    /// At capacity and the element displaced the current maximum,
    /// which is handed back.
    Replaced(T),
}

/// Array-backed binary max-heap with a caller-supplied comparator.
pub struct EvictionHeap<T, C: Compare<T>> {
    elems: Vec<T>,
    capacity: usize,
    state: HeapState,
    cmp: C,
}

impl<T, C: Compare<T>> EvictionHeap<T, C> {
    /// Create a heap holding at most `capacity` elements.
    ///
    /// The backing buffer is allocated up front; no operation after this
    /// point allocates. A zero-capacity heap is legal and rejects every
    /// element.
    pub fn with_capacity(capacity: usize, cmp: C) -> Self {
        EvictionHeap {
            elems: Vec::with_capacity(capacity),
            capacity,
            state: HeapState::Consistent,
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> HeapState {
        self.state
    }

    /// Drop all elements. The empty heap is trivially consistent, so the
    /// preallocated buffer can be reused across cleanup passes.
    pub fn clear(&mut self) {
        self.elems.clear();
        self.state = HeapState::Consistent;
    }

    /// Empty the heap and set a new logical bound. The bound must fit the
    /// original allocation; this never reallocates.
    pub fn reset(&mut self, capacity: usize) {
        debug_assert!(
            capacity <= self.elems.capacity(),
            "reset bound exceeds the allocated capacity"
        );
        self.elems.clear();
        self.capacity = capacity;
        self.state = HeapState::Consistent;
    }

    /// Append without restoring order. The heap is `Inconsistent` until
    /// [`EvictionHeap::build`] runs.
    pub fn add(&mut self, elem: T) -> Result<(), HeapFull> {
        if self.elems.len() >= self.capacity {
            return Err(HeapFull);
        }
        self.elems.push(elem);
        self.state = HeapState::Inconsistent;
        Ok(())
    }

    /// Establish the max-heap invariant bottom-up in O(n).
    ///
    /// No-op when the heap is already consistent.
    pub fn build(&mut self) {
        if self.state == HeapState::Consistent {
            return;
        }
        let len = self.elems.len();
        for i in (0..len / 2).rev() {
            self.sift_down(i, len);
        }
        self.state = HeapState::Consistent;
    }

    /// Append and sift up, maintaining the invariant incrementally.
    ///
    /// The heap must already be consistent; violating that is a caller
    /// contract error checked only in debug builds.
    pub fn insert(&mut self, elem: T) -> Result<(), HeapFull> {
        debug_assert_eq!(
            self.state,
            HeapState::Consistent,
            "insert on a heap that has not been built"
        );
        if self.elems.len() >= self.capacity {
            return Err(HeapFull);
        }
        self.elems.push(elem);
        self.sift_up(self.elems.len() - 1);
        Ok(())
    }

    /// Bounded reservoir insert: keep the `capacity` smallest elements
    /// seen so far.
    ///
    /// Under capacity this is a plain [`EvictionHeap::insert`]. At capacity
    /// the element is compared against the current maximum: if the maximum
    /// is greater, it is displaced and returned; otherwise the offered
    /// element comes straight back.
    pub fn try_insert(&mut self, elem: T) -> TryInsert<T> {
        debug_assert_eq!(self.state, HeapState::Consistent);
        if self.elems.len() < self.capacity {
            self.elems.push(elem);
            self.sift_up(self.elems.len() - 1);
            return TryInsert::Accepted;
        }
        if self.capacity == 0 {
            return TryInsert::Rejected(elem);
        }
        if self.cmp.compare(&self.elems[0], &elem) == Ordering::Greater {
            let old = std::mem::replace(&mut self.elems[0], elem);
            let len = self.elems.len();
            self.sift_down(0, len);
            TryInsert::Replaced(old)
        } else {
            TryInsert::Rejected(elem)
        }
    }

    /// Pop the maximum element, or `None` when empty.
    pub fn extract_max(&mut self) -> Option<T> {
        debug_assert_eq!(self.state, HeapState::Consistent);
        if self.elems.is_empty() {
            return None;
        }
        let last = self.elems.len() - 1;
        self.elems.swap(0, last);
        let max = self.elems.pop();
        if !self.elems.is_empty() {
            let len = self.elems.len();
            self.sift_down(0, len);
        }
        max
    }

    /// Borrow the maximum element without removing it.
    pub fn peek_max(&self) -> Option<&T> {
        debug_assert_eq!(self.state, HeapState::Consistent);
        self.elems.first()
    }

    /// Raw indexed read, used to drain the heap in storage order without
    /// destructive extraction.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.elems.get(index)
    }

    /// In-place heapsort to ascending comparator order.
    ///
    /// A view transform, not a resize: `len()` is unchanged afterwards and
    /// [`EvictionHeap::build`] restores the heap invariant. The heap state
    /// becomes `Sorted`.
    pub fn sort(&mut self) {
        self.build();
        let len = self.elems.len();
        for end in (1..len).rev() {
            self.elems.swap(0, end);
            self.sift_down(0, end);
        }
        self.state = HeapState::Sorted;
    }

    /// Iterate the backing buffer in storage order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.elems.iter()
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.cmp.compare(&self.elems[idx], &self.elems[parent]) == Ordering::Greater {
                self.elems.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    /// Sift `idx` down within `elems[..bound]`.
    fn sift_down(&mut self, mut idx: usize, bound: usize) {
        loop {
            let left = 2 * idx + 1;
            if left >= bound {
                break;
            }
            let right = left + 1;
            let mut largest = idx;
            if self.cmp.compare(&self.elems[left], &self.elems[largest]) == Ordering::Greater {
                largest = left;
            }
            if right < bound
                && self.cmp.compare(&self.elems[right], &self.elems[largest]) == Ordering::Greater
            {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.elems.swap(idx, largest);
            idx = largest;
        }
    }

    #[cfg(test)]
    fn assert_invariant(&self) {
        assert_eq!(self.state, HeapState::Consistent);
        for i in 0..self.elems.len() {
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.elems.len() {
                    assert_ne!(
                        self.cmp.compare(&self.elems[i], &self.elems[child]),
                        Ordering::Less,
                        "heap invariant violated at parent {i}, child {child}"
                    );
                }
            }
        }
    }
}
