//! Pairwise combination of two publishers.
//!
//! Both upstreams run as their own subscriptions and report into one
//! [`StateTask`]. Each side may hold at most one value waiting for its
//! partner; the side's subscriber stays suspended until that value is paired
//! and the downstream has answered, so neither side can run ahead.

use std::marker::PhantomData;

use async_trait::async_trait;

use crate::cancellable::Cancellable;
use crate::channel::{channel, BufferPolicy, Channel, EnqueueStatus};
use crate::demand::Demand;
use crate::error::Result;
use crate::publication::{Completion, Publication};
use crate::publisher::{resume_startup, Publisher};
use crate::resumption::Resumption;
use crate::state_task::{Effect, Reducer, StateTask};
use crate::subscriber::{BoxSubscriber, Subscriber};

/// Pair the values of `left` and `right` in order.
///
/// The stream ends as soon as either side completes; a value still waiting
/// on the other side is released with [`Demand::Cancel`].
pub fn zip<L, R>(left: Publisher<L>, right: Publisher<R>) -> Publisher<(L, R)>
where
    L: Send + 'static,
    R: Send + 'static,
{
    Publisher::new(move |startup, downstream| {
        let (channel, mailbox) = channel(BufferPolicy::Unbounded);
        let task = StateTask::spawn_with(
            channel,
            mailbox,
            ZipState::new(downstream),
            ZipReducer::default(),
        );
        let left_run = left
            .subscribe_with(None, Side::new(task.channel(), ZipAction::Left))
            .cancel_on_drop();
        let right_run = right
            .subscribe_with(None, Side::new(task.channel(), ZipAction::Right))
            .cancel_on_drop();
        let task = task.into_cancellable().cancel_on_drop();
        resume_startup(startup);

        Cancellable::spawn(async move {
            let state = task.value().await;
            drop((left_run, right_run));
            Ok(state?.last)
        })
    })
}

impl<T: Send + 'static> Publisher<T> {
    /// See [`zip`].
    pub fn zip<U: Send + 'static>(&self, other: &Publisher<U>) -> Publisher<(T, U)> {
        zip(self.clone(), other.clone())
    }
}

enum ZipAction<L, R> {
    Left(Publication<L>, Resumption<Demand>),
    Right(Publication<R>, Resumption<Demand>),
}

impl<L, R> ZipAction<L, R> {
    fn release(self) {
        match self {
            ZipAction::Left(_, resumption) | ZipAction::Right(_, resumption) => {
                resumption.resume(Demand::Cancel)
            }
        }
    }
}

struct ZipState<L, R> {
    left: Option<(L, Resumption<Demand>)>,
    right: Option<(R, Resumption<Demand>)>,
    downstream: BoxSubscriber<(L, R)>,
    last: Demand,
    completed: bool,
}

impl<L: Send + 'static, R: Send + 'static> ZipState<L, R> {
    fn new(downstream: BoxSubscriber<(L, R)>) -> Self {
        Self {
            left: None,
            right: None,
            downstream,
            last: Demand::None,
            completed: false,
        }
    }

    fn release_pending(&mut self) {
        if let Some((_, resumption)) = self.left.take() {
            resumption.resume(Demand::Cancel);
        }
        if let Some((_, resumption)) = self.right.take() {
            resumption.resume(Demand::Cancel);
        }
    }

    /// Emit a pair if both sides are waiting.
    async fn try_pair(&mut self) -> Result<Effect<ZipAction<L, R>>> {
        if self.left.is_none() || self.right.is_none() {
            return Ok(Effect::None);
        }
        let (Some((left, left_resumption)), Some((right, right_resumption))) =
            (self.left.take(), self.right.take())
        else {
            return Ok(Effect::None);
        };

        match self.downstream.receive(Publication::Value((left, right))).await {
            Ok(demand) if demand.is_cancel() => {
                self.completed = true;
                self.last = demand;
                left_resumption.resume(Demand::Cancel);
                right_resumption.resume(Demand::Cancel);
                Ok(Effect::Complete(Completion::Finished))
            }
            Ok(demand) => {
                self.last = demand;
                left_resumption.resume(demand);
                right_resumption.resume(demand);
                Ok(Effect::None)
            }
            Err(error) => {
                self.completed = true;
                left_resumption.resume(Demand::Cancel);
                right_resumption.resume(Demand::Cancel);
                Err(error)
            }
        }
    }

    async fn complete(&mut self, completion: Completion, resumption: Resumption<Demand>) -> Result<Effect<ZipAction<L, R>>> {
        resumption.resume(Demand::Cancel);
        self.release_pending();
        if !self.completed {
            self.completed = true;
            self.last = self.downstream.receive(Publication::Completion(completion)).await?;
        }
        Ok(Effect::Complete(Completion::Finished))
    }
}

struct ZipReducer<L, R> {
    _marker: PhantomData<fn() -> (L, R)>,
}

impl<L, R> Default for ZipReducer<L, R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<L: Send + 'static, R: Send + 'static> Reducer for ZipReducer<L, R> {
    type State = ZipState<L, R>;
    type Action = ZipAction<L, R>;

    async fn reduce(
        &mut self,
        state: &mut ZipState<L, R>,
        action: ZipAction<L, R>,
    ) -> Result<Effect<ZipAction<L, R>>> {
        match action {
            ZipAction::Left(Publication::Value(value), resumption) => {
                assert!(state.left.is_none(), "zip received a second left value before pairing the first");
                state.left = Some((value, resumption));
                state.try_pair().await
            }
            ZipAction::Right(Publication::Value(value), resumption) => {
                assert!(state.right.is_none(), "zip received a second right value before pairing the first");
                state.right = Some((value, resumption));
                state.try_pair().await
            }
            ZipAction::Left(Publication::Completion(completion), resumption)
            | ZipAction::Right(Publication::Completion(completion), resumption) => {
                state.complete(completion, resumption).await
            }
        }
    }

    async fn dispose(&mut self, action: ZipAction<L, R>, _completion: &Completion) {
        action.release();
    }

    async fn finalize(&mut self, state: &mut ZipState<L, R>, completion: &Completion) {
        state.release_pending();
        if !state.completed {
            state.completed = true;
            // Nobody is left to report a downstream error to.
            let _ = state
                .downstream
                .receive(Publication::Completion(completion.clone()))
                .await;
        }
    }
}

/// Subscriber for one side; reports into the zip task and waits for its turn.
struct Side<T, L, R> {
    channel: Channel<ZipAction<L, R>>,
    wrap: fn(Publication<T>, Resumption<Demand>) -> ZipAction<L, R>,
    done: bool,
}

impl<T, L, R> Side<T, L, R> {
    fn new(
        channel: Channel<ZipAction<L, R>>,
        wrap: fn(Publication<T>, Resumption<Demand>) -> ZipAction<L, R>,
    ) -> Self {
        Self {
            channel,
            wrap,
            done: false,
        }
    }
}

#[async_trait]
impl<T, L, R> Subscriber<T> for Side<T, L, R>
where
    T: Send + 'static,
    L: Send + 'static,
    R: Send + 'static,
{
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        if self.done {
            return Ok(Demand::Cancel);
        }
        if publication.is_completion() {
            self.done = true;
        }
        let (resumption, turn) = Resumption::pair();
        match self.channel.offer((self.wrap)(publication, resumption)) {
            EnqueueStatus::Enqueued => {}
            EnqueueStatus::Dropped(action) | EnqueueStatus::Terminated(action) => {
                action.release();
                self.done = true;
            }
        }
        let demand = turn.await?;
        if demand.is_cancel() {
            self.done = true;
        }
        Ok(demand)
    }
}
