//! Lock-free multi-producer multi-consumer FIFO queue.
//!
//! Michael–Scott queue over a sentinel node. Nodes are reclaimed through
//! crossbeam-epoch: a dequeued sentinel is retired with `defer_destroy` and
//! freed only once no pinned thread can still be reading it.
//!
//! After a dequeue swings `head` past a node, that node's `next` pointer is
//! tagged [`UNLINKED`]. A thread that loaded the node before the swing sees
//! the tag and reloads instead of treating the node as the live tail.

use std::mem::MaybeUninit;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

/// Tag on `next` marking a node that is no longer reachable from `head`.
const UNLINKED: usize = 1;

struct Node<T> {
    /// Uninitialized in the sentinel; taken exactly once otherwise.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

/// Unbounded lock-free FIFO queue.
pub struct Queue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
}

// SAFETY: values are moved in by one thread and out by exactly one other;
// no `&T` is ever shared between threads.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };
        // SAFETY: the queue is not shared yet.
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        queue.head.store(sentinel, Relaxed);
        queue.tail.store(sentinel, Relaxed);
        queue
    }

    /// Append `value` at the tail.
    pub fn enqueue(&self, value: T) {
        let guard = &epoch::pin();
        let node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(guard);

        loop {
            let tail = self.tail.load(Acquire, guard);
            // SAFETY: `tail` is never null and cannot be freed while pinned.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Acquire, guard);

            if next.tag() == UNLINKED {
                continue;
            }
            if !next.is_null() {
                // Tail is lagging; help it forward.
                let _ = self.tail.compare_exchange(tail, next, Release, Relaxed, guard);
                continue;
            }
            if tail_ref
                .next
                .compare_exchange(Shared::null(), node, Release, Relaxed, guard)
                .is_ok()
            {
                let _ = self.tail.compare_exchange(tail, node, Release, Relaxed, guard);
                return;
            }
        }
    }

    /// Remove the value at the head, if any.
    pub fn dequeue(&self) -> Option<T> {
        self.pop(&epoch::pin())
    }

    fn pop(&self, guard: &Guard) -> Option<T> {
        loop {
            let head = self.head.load(Acquire, guard);
            // SAFETY: `head` is never null and cannot be freed while pinned.
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Acquire, guard);

            if next.tag() == UNLINKED {
                continue;
            }
            // SAFETY: a non-null successor stays allocated while pinned.
            let next_ref = unsafe { next.as_ref() }?;

            let tail = self.tail.load(Relaxed, guard);
            if tail == head {
                let _ = self.tail.compare_exchange(tail, next, Release, Relaxed, guard);
            }

            if self
                .head
                .compare_exchange(head, next, Release, Relaxed, guard)
                .is_ok()
            {
                head_ref.next.fetch_or(UNLINKED, Release, guard);
                // SAFETY: `head` is unreachable now; `next` becomes the
                // sentinel and only the winner of the swing reads its value.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(next_ref.value.assume_init_read());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Acquire, guard);
            // SAFETY: see `pop`.
            let next = unsafe { head.deref() }.next.load(Acquire, guard);
            if next.tag() != UNLINKED {
                return next.is_null();
            }
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can touch the queue.
        unsafe {
            let guard = epoch::unprotected();
            while self.pop(guard).is_some() {}
            let sentinel = self.head.load(Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}
