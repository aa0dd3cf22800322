//! One-shot continuations with an exactly-once guarantee.
//!
//! A [`Resumption`] is the sending half: it may be cloned and handed to
//! several closures, but only one of them may ever resume it. A second
//! resume is a protocol violation and panics. The receiving half is a
//! [`Suspension`], a future that resolves with whatever the resumption was
//! resumed with.
//!
//! ```ignore
//! let (resumption, suspension) = Resumption::<u32>::pair();
//! tokio::spawn(async move { resumption.resume(42) });
//! assert_eq!(suspension.await?, 42);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SluiceError};
use crate::leak::{HandleKind, HandleState, LeakPolicy, Provenance};

/// The resuming half of a one-shot continuation.
pub struct Resumption<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: HandleState,
    sender: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T> Clone for Resumption<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Resumption<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resumption")
            .field("id", &self.inner.state.id())
            .field("completed", &self.inner.state.is_completed())
            .finish()
    }
}

impl<T> Resumption<T> {
    /// Create a resumption and its suspension with the configured leak policy.
    #[track_caller]
    pub fn pair() -> (Resumption<T>, Suspension<T>) {
        Self::pair_with_policy(Config::current().leak_policy())
    }

    /// Create a resumption and its suspension with an explicit leak policy.
    #[track_caller]
    pub fn pair_with_policy(policy: LeakPolicy) -> (Resumption<T>, Suspension<T>) {
        let provenance = Provenance::here();
        let (sender, receiver) = oneshot::channel();
        let resumption = Resumption {
            inner: Arc::new(Inner {
                state: HandleState::new(HandleKind::Resumption, policy, provenance),
                sender: Mutex::new(Some(sender)),
            }),
        };
        (
            resumption,
            Suspension {
                receiver,
                provenance,
            },
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.state.id()
    }

    /// Whether this resumption has already fired.
    pub fn is_completed(&self) -> bool {
        self.inner.state.is_completed()
    }

    /// Resume the suspension with a value.
    ///
    /// # Panics
    ///
    /// Panics if the resumption was already resumed.
    #[track_caller]
    pub fn resume(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Resume the suspension with an error.
    ///
    /// # Panics
    ///
    /// Panics if the resumption was already resumed.
    #[track_caller]
    pub fn resume_throwing(&self, error: SluiceError) {
        self.settle(Err(error));
    }

    /// Resume with [`SluiceError::Cancelled`] unless already resumed.
    ///
    /// Unlike `resume`, cancelling an already-fired resumption is a no-op.
    pub fn cancel(&self) {
        if self.inner.state.complete() {
            self.inner.state.cancel();
            self.deliver(Err(SluiceError::Cancelled));
        }
    }

    #[track_caller]
    fn settle(&self, outcome: Result<T>) {
        if !self.inner.state.complete() {
            panic!(
                "resumption {} resumed twice (created at {})",
                self.inner.state.id(),
                self.inner.state.provenance()
            );
        }
        self.deliver(outcome);
    }

    fn deliver(&self, outcome: Result<T>) {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The suspension may have been dropped; nobody is left to tell.
            let _ = sender.send(outcome);
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.state.check_leak() {
            self.state.cancel();
            let sender = self
                .sender
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(Err(SluiceError::Leaked(self.state.provenance())));
            }
        }
    }
}

/// The awaiting half of a one-shot continuation.
#[must_use = "a suspension does nothing unless awaited"]
pub struct Suspension<T> {
    receiver: oneshot::Receiver<Result<T>>,
    provenance: Provenance,
}

impl<T> Future for Suspension<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let provenance = self.provenance;
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SluiceError::Leaked(provenance))))
    }
}

/// Hand a fresh resumption to `f` and return the suspension to await.
#[track_caller]
pub fn with_resumption<T, F>(f: F) -> Suspension<T>
where
    F: FnOnce(Resumption<T>),
{
    let (resumption, suspension) = Resumption::pair();
    f(resumption);
    suspension
}
