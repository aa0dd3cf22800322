//! Leak policy and the state shared by every handle.
//!
//! A handle (a [`Cancellable`](crate::Cancellable) or a
//! [`Resumption`](crate::Resumption)) owns exactly one unit of asynchronous
//! work. It must end in exactly one of three ways:
//!
//! 1. **Completed** - the work produced its outcome
//! 2. **Cancelled** - someone called `cancel()`
//! 3. **Leaked** - the handle was dropped while neither of the above held
//!
//! The third case is a bug in the code that created the handle. What happens
//! then is decided by the handle's [`LeakPolicy`], evaluated in `Drop`.

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

/// What to do when a handle is dropped before completion or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Panic with the handle's provenance. Default in debug builds.
    Assert,
    /// Emit an error through `tracing` and force-cancel, so the awaiting
    /// side observes [`SluiceError::Leaked`](crate::SluiceError::Leaked)
    /// instead of hanging. Default in release builds.
    LogAndCancel,
    /// Force-cancel without a diagnostic.
    SilentCancel,
}

impl Default for LeakPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LeakPolicy::Assert
        } else {
            LeakPolicy::LogAndCancel
        }
    }
}

/// Where and when a handle was created.
#[derive(Debug, Clone, Copy)]
pub struct Provenance {
    location: &'static Location<'static>,
    created_at: DateTime<Utc>,
}

impl Provenance {
    /// Capture the caller's location and the current time.
    #[track_caller]
    pub fn here() -> Self {
        Self {
            location: Location::caller(),
            created_at: Utc::now(),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} on {}",
            self.location.file(),
            self.location.line(),
            self.location.column(),
            self.created_at.to_rfc3339()
        )
    }
}

/// The two handle flavours, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Cancellable,
    Resumption,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Cancellable => f.write_str("cancellable"),
            HandleKind::Resumption => f.write_str("resumption"),
        }
    }
}

/// Flags shared between a handle and the work it owns.
#[derive(Debug)]
pub(crate) struct HandleState {
    id: Uuid,
    kind: HandleKind,
    policy: LeakPolicy,
    provenance: Provenance,
    completed: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl HandleState {
    pub(crate) fn new(kind: HandleKind, policy: LeakPolicy, provenance: Provenance) -> Self {
        let id = Uuid::new_v4();

        #[cfg(debug_assertions)]
        crate::audit::track(id, kind, provenance);

        Self {
            id,
            kind,
            policy,
            provenance,
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub(crate) fn policy(&self) -> LeakPolicy {
        self.policy
    }

    /// Mark the work completed. Returns true only for the call that
    /// performed the transition.
    pub(crate) fn complete(&self) -> bool {
        let first = !self.completed.swap(true, Ordering::AcqRel);
        if first {
            #[cfg(debug_assertions)]
            crate::audit::forget(self.id);
        }
        first
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Raise the cancellation flag and wake anyone waiting on it. Returns
    /// true only for the call that performed the transition.
    pub(crate) fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            #[cfg(debug_assertions)]
            crate::audit::forget(self.id);
            self.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`HandleState::cancel`] has been called.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Apply the leak policy for a handle being dropped.
    ///
    /// Returns true when the caller must force-cancel the underlying work.
    pub(crate) fn check_leak(&self) -> bool {
        if self.is_completed() || self.is_cancelled() {
            return false;
        }
        match self.policy {
            LeakPolicy::Assert => {
                // A second panic while unwinding would abort the process.
                if std::thread::panicking() {
                    return true;
                }
                panic!(
                    "leaked {} {}: dropped before completion or cancellation (created at {})",
                    self.kind, self.id, self.provenance
                );
            }
            LeakPolicy::LogAndCancel => {
                tracing::error!(
                    handle_id = %self.id,
                    kind = %self.kind,
                    location = %self.provenance,
                    "handle dropped before completion, cancelling"
                );
                true
            }
            LeakPolicy::SilentCancel => true,
        }
    }
}

impl Drop for HandleState {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        crate::audit::forget(self.id);
    }
}
