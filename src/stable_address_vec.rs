// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A collection type with stable addresses while elements are added to the collection.

This is primarily useful for building lists with inner references which could in theory
be done in two passes, but this is more convenient.
*/

use std::cell::UnsafeCell;

pub struct StableAddressVec<T> {
    vec: UnsafeCell<Vec<T>>,
}

// SAFETY: `push` mutates through the `UnsafeCell` without its own locking,
// so callers sharing a `StableAddressVec` across threads must serialize
// calls to `push` themselves (the delegate arena does this with a mutex
// around chunk selection). Once an element has been pushed it is never
// moved or mutated again, so reading a previously-returned `&T` is safe
// without further synchronization.
unsafe impl<T: Send> Sync for StableAddressVec<T> {}

impl<T> StableAddressVec<T> {
    /**
    Creates a new StableAddressVec with the specified capacity.

    Unlike a normal Vec, this capacity cannot be changed later, as reallocation
    would change the element addresses.
    */
    pub fn with_capactiy(capacity: usize) -> Self {
        Self {
            vec: UnsafeCell::new(Vec::with_capacity(capacity)),
        }
    }

    /// Number of elements pushed so far.
    pub fn len(&self) -> usize {
        unsafe { (*self.vec.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, value: T) -> &T {
        let (next_len, capacity) = unsafe {
            //safe because we are the only ones with access to the vec, and we only perform read ops
            let vec = &*self.vec.get();
            (vec.len() + 1, vec.capacity())
        };

        assert!(
            next_len <= capacity,
            "Cannot push to a StableAddressVec that has reached capacity"
        );
        //safe because we won't reallocate
        unsafe {
            (*self.vec.get()).push(value);
            //safe because we just pushed the value
            &(&(*self.vec.get()))[next_len - 1]
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        //safe because we are the only ones with access to the vec, and we are consuming it
        unsafe { (*self.vec.get()).drain(..).collect() }
    }
}

impl<T> From<StableAddressVec<T>> for Vec<T> {
    fn from(val: StableAddressVec<T>) -> Self {
        val.into_vec()
    }
}
