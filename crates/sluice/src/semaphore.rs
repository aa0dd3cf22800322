//! Counting join: fold N actions into a state, then resume once.
//!
//! A [`Semaphore`] is created with a target count, an initial state, a fold
//! function and one [`Resumption`]. Every [`Semaphore::decrement`] folds its
//! action into the state; the decrement that reaches zero resumes the
//! resumption with the folded state. Clones share the same count.
//!
//! ```ignore
//! let (semaphore, total) = Semaphore::join(3, 0u32, |sum: &mut u32, n: u32| *sum += n);
//! for n in 1..=3 {
//!     semaphore.decrement(n);
//! }
//! assert_eq!(total.await?, 6);
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use crate::resumption::{Resumption, Suspension};

type Fold<S, A> = Box<dyn Fn(&mut S, A) + Send + Sync>;

/// Shared counting join over a folded state.
pub struct Semaphore<S, A> {
    inner: Arc<Inner<S, A>>,
}

struct Inner<S, A> {
    count: StdMutex<Countdown<S>>,
    fold: Fold<S, A>,
    resumption: Resumption<S>,
}

struct Countdown<S> {
    remaining: usize,
    state: Option<S>,
}

impl<S, A> Clone for Semaphore<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, A> std::fmt::Debug for Semaphore<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("remaining", &self.remaining())
            .field("resumption", &self.inner.resumption)
            .finish()
    }
}

impl<S, A> Semaphore<S, A> {
    /// Create a semaphore that resumes `resumption` after `count` decrements.
    ///
    /// A zero count resumes immediately with `state`.
    pub fn new<F>(count: usize, state: S, fold: F, resumption: Resumption<S>) -> Self
    where
        F: Fn(&mut S, A) + Send + Sync + 'static,
    {
        let state = if count == 0 {
            resumption.resume(state);
            None
        } else {
            Some(state)
        };
        Self {
            inner: Arc::new(Inner {
                count: StdMutex::new(Countdown {
                    remaining: count,
                    state,
                }),
                fold: Box::new(fold),
                resumption,
            }),
        }
    }

    /// Create a semaphore together with the suspension it will resume.
    #[track_caller]
    pub fn join<F>(count: usize, state: S, fold: F) -> (Self, Suspension<S>)
    where
        F: Fn(&mut S, A) + Send + Sync + 'static,
    {
        let (resumption, suspension) = Resumption::pair();
        (Self::new(count, state, fold, resumption), suspension)
    }

    /// Fold `action` into the state and count down by one.
    ///
    /// # Panics
    ///
    /// Panics if the count has already reached zero.
    pub fn decrement(&self, action: A) {
        let fired = {
            let mut count = self
                .inner
                .count
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            assert!(
                count.remaining > 0,
                "semaphore {} decremented past zero",
                self.inner.resumption.id()
            );
            if let Some(state) = count.state.as_mut() {
                (self.inner.fold)(state, action);
            }
            count.remaining -= 1;
            if count.remaining == 0 {
                count.state.take()
            } else {
                None
            }
        };
        if let Some(state) = fired {
            self.inner.resumption.resume(state);
        }
    }

    /// Decrements still needed before the resumption fires.
    pub fn remaining(&self) -> usize {
        self.inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remaining
    }
}

impl Semaphore<(), ()> {
    /// Stateless latch that opens after `count` decrements.
    #[track_caller]
    pub fn countdown(count: usize) -> (Self, Suspension<()>) {
        Self::join(count, (), |_, _| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_folds_then_fires_once() {
        let (semaphore, total) = Semaphore::join(3, Vec::new(), |seen: &mut Vec<u32>, n| seen.push(n));
        semaphore.decrement(1);
        semaphore.clone().decrement(2);
        assert_eq!(semaphore.remaining(), 1);
        semaphore.decrement(3);
        assert_eq!(semaphore.remaining(), 0);
        assert_eq!(total.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zero_count_fires_immediately() {
        let (semaphore, state) = Semaphore::<&'static str, ()>::join(0, "untouched", |_, _| {});
        assert_eq!(semaphore.remaining(), 0);
        assert_eq!(state.await.unwrap(), "untouched");
    }

    #[tokio::test]
    async fn test_countdown_across_tasks() {
        let (latch, opened) = Semaphore::countdown(8);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.decrement(()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        opened.await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "decremented past zero")]
    async fn test_underflow_panics() {
        let (semaphore, _state) = Semaphore::countdown(1);
        semaphore.decrement(());
        semaphore.decrement(());
    }
}
