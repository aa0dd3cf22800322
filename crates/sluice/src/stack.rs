//! Lock-free stack: many pushers, one consumer.
//!
//! Pushes are a CAS loop on the top pointer and may come from any thread.
//! Popping is restricted to one consumer at a time; with a single consumer
//! no node can be freed and re-pushed under a pending CAS, so the stack is
//! free of ABA without tagged pointers. Two overlapping pops panic.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Multi-producer single-consumer lock-free stack.
pub struct Stack<T> {
    last: AtomicPtr<Node<T>>,
    len: AtomicUsize,
    popping: AtomicBool,
}

// SAFETY: nodes are owned by the stack; values move between threads only
// by value.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack").field("len", &self.len()).finish()
    }
}

/// Marks the consumer side busy for the lifetime of one pop.
struct ConsumerGuard<'a>(&'a AtomicBool);

impl<'a> ConsumerGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        if flag.swap(true, Ordering::Acquire) {
            panic!("Stack popped concurrently from two consumers");
        }
        Self(flag)
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Self {
            last: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            popping: AtomicBool::new(false),
        }
    }

    /// Push a value. Safe from any number of threads.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let backoff = Backoff::new();
        loop {
            let last = self.last.load(Ordering::Acquire);
            // SAFETY: `node` is not published until the CAS succeeds.
            unsafe {
                (*node).next = last;
            }
            if self
                .last
                .compare_exchange_weak(last, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
            backoff.spin();
        }
    }

    /// Pop the most recently pushed value.
    ///
    /// # Panics
    ///
    /// Panics if another pop or `pop_all` is running at the same time.
    pub fn pop(&self) -> Option<T> {
        let _consumer = ConsumerGuard::acquire(&self.popping);
        let backoff = Backoff::new();
        loop {
            let last = self.last.load(Ordering::Acquire);
            if last.is_null() {
                return None;
            }
            // SAFETY: only the consumer frees nodes, and we are the consumer.
            let next = unsafe { (*last).next };
            if self
                .last
                .compare_exchange_weak(last, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: the node is unlinked and was allocated by `push`.
                let node = unsafe { Box::from_raw(last) };
                return Some(node.value);
            }
            backoff.spin();
        }
    }

    /// Take every value at once, most recent first.
    ///
    /// # Panics
    ///
    /// Panics if another pop or `pop_all` is running at the same time.
    pub fn pop_all(&self) -> Vec<T> {
        let _consumer = ConsumerGuard::acquire(&self.popping);
        let mut cursor = self.last.swap(ptr::null_mut(), Ordering::Acquire);
        let mut values = Vec::new();
        while !cursor.is_null() {
            // SAFETY: the whole chain was detached by the swap above.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
            values.push(node.value);
        }
        self.len.fetch_sub(values.len(), Ordering::Relaxed);
        values
    }

    /// Approximate number of values; exact when no push is in flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.last.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        drop(self.pop_all());
    }
}
