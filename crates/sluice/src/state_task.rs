//! Serialized state machines fed by a mailbox.
//!
//! A [`StateTask`] owns one piece of state and one [`Mailbox`]. Its loop
//! takes one action at a time, hands it to a [`Reducer`] together with the
//! state, and interprets the returned [`Effect`]. The state is never
//! reachable from outside the loop, so no locking is needed around it.
//!
//! ## Loop
//!
//! ```text
//! ┌──────────────► await next action or cancellation
//! │                      │
//! │                      ▼
//! │               reduce(state, action)
//! │                      │
//! │                      ▼
//! └──────────────── interpret Effect
//! ```
//!
//! Cancellation is cooperative and observed only while waiting for the next
//! action, never in the middle of a reduction. On exit, whatever the reason:
//!
//! 1. the mailbox is closed
//! 2. publishers started through [`Effect::Published`] are cancelled
//! 3. actions still queued are handed to [`Reducer::dispose`]
//! 4. [`Reducer::finalize`] sees the state and the exit [`Completion`]

use async_trait::async_trait;

use crate::cancellable::{CancelSignal, Cancellable};
use crate::channel::{channel, Channel, EnqueueStatus, Mailbox};
use crate::config::Config;
use crate::demand::Demand;
use crate::error::{Result, SluiceError};
use crate::publication::{Completion, Publication};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;

/// Decides how a state changes in response to one action.
#[async_trait]
pub trait Reducer: Send + 'static {
    type State: Send + 'static;
    type Action: Send + 'static;

    /// Apply one action. An error ends the task with that failure.
    async fn reduce(
        &mut self,
        state: &mut Self::State,
        action: Self::Action,
    ) -> Result<Effect<Self::Action>>;

    /// Release an action that was still queued when the task exited.
    ///
    /// Actions carrying a [`Resumption`](crate::Resumption) must resume or
    /// cancel it here.
    async fn dispose(&mut self, action: Self::Action, completion: &Completion) {
        let _ = (action, completion);
    }

    /// Last look at the state before the task ends.
    async fn finalize(&mut self, state: &mut Self::State, completion: &Completion) {
        let _ = (state, completion);
    }
}

/// What the loop does after a reduction.
pub enum Effect<A> {
    None,
    /// Run a synchronous callback once, right away.
    FireAndForget(Box<dyn FnOnce() + Send>),
    /// Subscribe to a publisher and feed each of its values back into this
    /// task's mailbox.
    ///
    /// If a bounded mailbox drops a fed-back value, the subscription ends
    /// with [`SluiceError::EnqueueError`] and the publisher is not pulled
    /// again.
    Published(Publisher<A>),
    /// Exit the loop with this completion.
    Complete(Completion),
}

impl<A> std::fmt::Debug for Effect<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::None => f.write_str("None"),
            Effect::FireAndForget(_) => f.write_str("FireAndForget"),
            Effect::Published(_) => f.write_str("Published"),
            Effect::Complete(completion) => f.debug_tuple("Complete").field(completion).finish(),
        }
    }
}

impl<A> Effect<A> {
    pub fn fire_and_forget(f: impl FnOnce() + Send + 'static) -> Self {
        Effect::FireAndForget(Box::new(f))
    }
}

/// Handle to a running state machine.
#[must_use = "dropping a running StateTask applies its leak policy"]
pub struct StateTask<S, A> {
    channel: Channel<A>,
    handle: Cancellable<S>,
}

impl<S, A> std::fmt::Debug for StateTask<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTask")
            .field("handle", &self.handle)
            .field("channel", &self.channel)
            .finish()
    }
}

impl<S: Send + 'static, A: Send + 'static> StateTask<S, A> {
    /// Start a task over a fresh mailbox using the configured buffer policy.
    #[track_caller]
    pub fn spawn<R>(initial: S, reducer: R) -> Self
    where
        R: Reducer<State = S, Action = A>,
    {
        let (channel, mailbox) = channel(Config::current().mailbox_policy());
        Self::spawn_with(channel, mailbox, initial, reducer)
    }

    /// Start a task over an existing channel.
    #[track_caller]
    pub fn spawn_with<R>(channel: Channel<A>, mailbox: Mailbox<A>, initial: S, reducer: R) -> Self
    where
        R: Reducer<State = S, Action = A>,
    {
        let feedback = channel.uncounted();
        let handle = Cancellable::spawn_cooperative(move |signal| {
            run_loop(signal, feedback, mailbox, initial, reducer)
        });
        Self { channel, handle }
    }

    /// Wait for the task to exit.
    ///
    /// The task's own sender is released first, so a task nobody else can
    /// send to finishes once its queued actions are reduced.
    pub async fn value(self) -> Result<S> {
        self.into_cancellable().value().await
    }

    /// Give up the sender and keep only the task handle.
    pub fn into_cancellable(self) -> Cancellable<S> {
        let StateTask { channel, handle } = self;
        drop(channel);
        handle
    }
}

impl<S, A: Send> StateTask<S, A> {
    /// Another sender for this task's mailbox.
    pub fn channel(&self) -> Channel<A> {
        self.channel.clone()
    }

    pub fn send(&self, action: A) -> Result<()> {
        self.channel.send(action)
    }

    pub fn offer(&self, action: A) -> EnqueueStatus<A> {
        self.channel.offer(action)
    }

    /// Stop accepting actions; the task exits after reducing what is queued.
    pub fn finish(&self) {
        self.channel.finish();
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_loop<R: Reducer>(
    signal: CancelSignal,
    feedback: Channel<R::Action>,
    mut mailbox: Mailbox<R::Action>,
    mut state: R::State,
    mut reducer: R,
) -> Result<R::State> {
    tracing::debug!(reducer = std::any::type_name::<R>(), "state task started");
    let mut children = Children::default();

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = signal.cancelled() => None,
            action = mailbox.recv() => Some(action),
        };
        let action = match next {
            None => break Completion::Cancelled,
            Some(None) => break Completion::Finished,
            Some(Some(action)) => action,
        };

        tracing::trace!("reducing action");
        match reducer.reduce(&mut state, action).await {
            Ok(Effect::None) => {}
            Ok(Effect::FireAndForget(callback)) => callback(),
            Ok(Effect::Published(publisher)) => {
                let feed = Feedback {
                    channel: feedback.clone(),
                };
                children.adopt(publisher.subscribe_with(None, feed));
            }
            Ok(Effect::Complete(completion)) => break completion,
            Err(error) => break Completion::from_result::<()>(&Err(error)),
        }
    };

    mailbox.close();
    drop(children);
    for action in mailbox.drain() {
        reducer.dispose(action, &exit).await;
    }
    reducer.finalize(&mut state, &exit).await;
    tracing::debug!(
        reducer = std::any::type_name::<R>(),
        reason = ?exit,
        "state task exited"
    );

    match exit {
        Completion::Finished => Ok(state),
        Completion::Cancelled => Err(SluiceError::Cancelled),
        Completion::Failure(error) => Err(error),
    }
}

/// Subscriptions started by [`Effect::Published`]; cancelled when dropped.
#[derive(Default)]
struct Children(Vec<Cancellable<Demand>>);

impl Children {
    fn adopt(&mut self, child: Cancellable<Demand>) {
        self.0.retain(|running| !running.is_finished());
        self.0.push(child);
    }
}

impl Drop for Children {
    fn drop(&mut self) {
        for child in &self.0 {
            child.cancel();
        }
    }
}

/// Feeds published values back into the owning task's mailbox.
struct Feedback<A> {
    channel: Channel<A>,
}

#[async_trait]
impl<A: Send + 'static> Subscriber<A> for Feedback<A> {
    async fn receive(&mut self, publication: Publication<A>) -> Result<Demand> {
        let Publication::Value(action) = publication else {
            return Ok(Demand::Cancel);
        };
        match self.channel.offer(action) {
            EnqueueStatus::Enqueued => Ok(Demand::max(1)),
            EnqueueStatus::Dropped(_) => Err(SluiceError::EnqueueError),
            EnqueueStatus::Terminated(_) => Ok(Demand::Cancel),
        }
    }
}
