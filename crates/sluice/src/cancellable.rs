//! Owning handles over one background task.
//!
//! A [`Cancellable`] starts exactly one tokio task and owns it. The task ends
//! in exactly one of three ways:
//!
//! - **Completed** - the outcome is retrieved once through [`Cancellable::value`]
//! - **Cancelled** - [`Cancellable::cancel`] was called
//! - **Leaked** - the handle was dropped first; see [`LeakPolicy`]
//!
//! ## Cancellation
//!
//! Cancellation never interrupts synchronous code. A task spawned with
//! [`Cancellable::spawn`] is aborted, which takes effect at its next `.await`.
//! A task spawned with [`Cancellable::spawn_cooperative`] is only told about
//! it through a [`CancelSignal`] and chooses where to look.
//!
//! Awaiting a handle is structured: if the future awaiting [`Cancellable::value`]
//! is dropped before the outcome arrives, the awaited task is cancelled. This
//! is how cancelling a derived handle (`map`, `and_then`, `join`) reaches the
//! handles it was built from.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SluiceError};
use crate::leak::{HandleKind, HandleState, LeakPolicy, Provenance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelMode {
    Abort,
    Cooperative,
}

/// Observes cancellation of the [`Cancellable`] that owns the current task.
#[derive(Clone)]
pub struct CancelSignal {
    state: Arc<HandleState>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Resolves once the owning handle is cancelled.
    pub async fn cancelled(&self) {
        self.state.cancelled().await
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Owning, leak-checked handle over one spawned task.
#[must_use = "dropping a running Cancellable applies its leak policy"]
pub struct Cancellable<T> {
    state: Arc<HandleState>,
    task: Option<JoinHandle<Result<T>>>,
    mode: CancelMode,
}

impl<T> std::fmt::Debug for Cancellable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("id", &self.state.id())
            .field("finished", &self.is_finished())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> Cancellable<T> {
    /// Spawn `future` with the configured leak policy. Cancelling aborts it.
    #[track_caller]
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::spawn_with_policy(Config::current().leak_policy(), future)
    }

    /// Spawn `future` with an explicit leak policy. Cancelling aborts it.
    #[track_caller]
    pub fn spawn_with_policy<F>(policy: LeakPolicy, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::launch(policy, Provenance::here(), CancelMode::Abort, |_| future)
    }

    /// Spawn a task that observes cancellation through a [`CancelSignal`]
    /// instead of being aborted.
    #[track_caller]
    pub fn spawn_cooperative<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::spawn_cooperative_with_policy(Config::current().leak_policy(), make)
    }

    #[track_caller]
    pub fn spawn_cooperative_with_policy<F, Fut>(policy: LeakPolicy, make: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::launch(policy, Provenance::here(), CancelMode::Cooperative, make)
    }

    /// A handle that is already complete with `value`.
    #[track_caller]
    pub fn ready(value: T) -> Self {
        Self::spawn(async move { Ok(value) })
    }

    fn launch<F, Fut>(policy: LeakPolicy, provenance: Provenance, mode: CancelMode, make: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let state = Arc::new(HandleState::new(HandleKind::Cancellable, policy, provenance));
        let future = make(CancelSignal {
            state: state.clone(),
        });
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let outcome = future.await;
            task_state.complete();
            outcome
        });
        Self {
            state,
            task: Some(task),
            mode,
        }
    }

    /// Transform the outcome. Cancelling the result cancels `self`.
    #[track_caller]
    pub fn map<U, F>(self, f: F) -> Cancellable<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let policy = self.state.policy();
        let source = self.cancel_on_drop();
        Cancellable::spawn_with_policy(policy, async move { source.value().await.map(f) })
    }

    /// Chain a dependent handle. Cancelling the result cancels whichever of
    /// `self` or the handle returned by `f` is running.
    #[track_caller]
    pub fn and_then<U, F>(self, f: F) -> Cancellable<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Cancellable<U> + Send + 'static,
    {
        let policy = self.state.policy();
        let source = self.cancel_on_drop();
        Cancellable::spawn_with_policy(policy, async move {
            let value = source.value().await?;
            f(value).value().await
        })
    }

    /// Wait for both handles. The first failure cancels the other one.
    #[track_caller]
    pub fn join<U>(self, other: Cancellable<U>) -> Cancellable<(T, U)>
    where
        U: Send + 'static,
    {
        let policy = self.state.policy();
        let left = self.cancel_on_drop();
        let right = other.cancel_on_drop();
        Cancellable::spawn_with_policy(policy, async move {
            futures::future::try_join(left.value(), right.value()).await
        })
    }

    /// Wait for every handle, preserving order.
    #[track_caller]
    pub fn join_all(handles: Vec<Cancellable<T>>) -> Cancellable<Vec<T>> {
        let pending: Vec<CancelOnDrop<T>> = handles
            .into_iter()
            .map(Cancellable::cancel_on_drop)
            .collect();
        Cancellable::spawn(async move {
            futures::future::try_join_all(pending.into_iter().map(CancelOnDrop::value)).await
        })
    }
}

impl<T> Cancellable<T> {
    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    /// Cancel the task. Idempotent; a no-op once the task has finished.
    pub fn cancel(&self) {
        self.state.cancel();
        if let (CancelMode::Abort, Some(task)) = (self.mode, self.task.as_ref()) {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Whether the task has produced its outcome.
    pub fn is_finished(&self) -> bool {
        self.state.is_completed() || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Await the task's outcome. The outcome can be taken exactly once.
    ///
    /// Cancelled tasks yield [`SluiceError::Cancelled`]. A panic inside the
    /// task is resumed on the awaiting side.
    pub async fn value(self) -> Result<T> {
        self.cancel_on_drop().value().await
    }

    /// Convert into a guard that cancels the task if it is dropped before
    /// the outcome is taken.
    pub fn cancel_on_drop(mut self) -> CancelOnDrop<T> {
        CancelOnDrop {
            state: self.state.clone(),
            task: self.task.take(),
            mode: self.mode,
            done: false,
        }
    }
}

impl<T> Drop for Cancellable<T> {
    fn drop(&mut self) {
        let Some(task) = self.task.as_ref() else {
            return;
        };
        if task.is_finished() {
            return;
        }
        if self.state.check_leak() {
            self.state.cancel();
            if self.mode == CancelMode::Abort {
                task.abort();
            }
        }
    }
}

/// A task whose owner is waiting for it; dropping this cancels the task.
#[must_use = "dropping a CancelOnDrop cancels the task"]
pub struct CancelOnDrop<T> {
    state: Arc<HandleState>,
    task: Option<JoinHandle<Result<T>>>,
    mode: CancelMode,
    done: bool,
}

impl<T> CancelOnDrop<T> {
    pub fn cancel(&self) {
        self.state.cancel();
        if let (CancelMode::Abort, Some(task)) = (self.mode, self.task.as_ref()) {
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_completed() || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Hand ownership back to a plain [`Cancellable`], restoring its leak check.
    pub fn disarm(mut self) -> Cancellable<T> {
        self.done = true;
        Cancellable {
            state: self.state.clone(),
            task: self.task.take(),
            mode: self.mode,
        }
    }

    /// Await the outcome.
    pub async fn value(mut self) -> Result<T> {
        let Some(task) = self.task.as_mut() else {
            return Err(SluiceError::Cancelled);
        };
        let joined = task.await;
        self.done = true;
        match joined {
            Ok(outcome) => outcome,
            Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
            Err(_) => Err(SluiceError::Cancelled),
        }
    }
}

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        if !self.done && !self.is_finished() {
            self.cancel();
        }
    }
}
