//! Fan-out of one stream to any number of subscribers.
//!
//! A [`Distributor`] is a [`StateTask`] holding the current subscriber set.
//! Each subscriber gets its own repeater: a small state task that owns the
//! subscriber and forwards whatever the distributor hands it.
//!
//! # Rounds
//!
//! [`Distributor::distribute`] runs one round:
//!
//! 1. the publication is offered to every repeater together with a shared
//!    [`Semaphore`] counting down from the number of repeaters
//! 2. each repeater delivers to its subscriber and decrements with the demand
//!    it got back
//! 3. once the semaphore fires, subscribers that answered `Cancel` (or whose
//!    repeater is gone) are removed, and the narrowest remaining demand is
//!    returned to the caller
//!
//! A round with no subscribers returns `Max(1)` so an upstream keeps flowing.
//! After a terminal round, late subscribers receive that completion at once.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::cancellable::{CancelOnDrop, Cancellable};
use crate::channel::{channel, BufferPolicy, Channel, EnqueueStatus};
use crate::demand::Demand;
use crate::error::{Result, SluiceError};
use crate::publication::{Completion, Publication};
use crate::publisher::{resume_startup, Publisher};
use crate::resumption::Resumption;
use crate::semaphore::Semaphore;
use crate::state_task::{Effect, Reducer, StateTask};
use crate::subscriber::BoxSubscriber;

type Acks = SmallVec<[(Uuid, Demand); 4]>;
type Round = Semaphore<Acks, (Uuid, Demand)>;

/// Broadcasts publications to every current subscriber.
pub struct Distributor<T> {
    channel: Channel<DistributorAction<T>>,
    terminal: Arc<OnceLock<Completion>>,
    _task: Arc<CancelOnDrop<DistributorState<T>>>,
}

impl<T> Clone for Distributor<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            terminal: self.terminal.clone(),
            _task: self._task.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Distributor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("terminal", &self.terminal.get())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for Distributor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Distributor<T> {
    #[track_caller]
    pub fn new() -> Self {
        let terminal = Arc::new(OnceLock::new());
        let (channel, mailbox) = channel(BufferPolicy::Unbounded);
        let task = StateTask::spawn_with(
            channel,
            mailbox,
            DistributorState {
                repeaters: SmallVec::new(),
            },
            DistributorReducer {
                terminal: terminal.clone(),
                _marker: PhantomData,
            },
        );
        let channel = task.channel();
        Self {
            channel,
            terminal,
            _task: Arc::new(task.into_cancellable().cancel_on_drop()),
        }
    }

    /// Broadcast one publication and wait until every subscriber answered.
    ///
    /// Returns the narrowest demand among the remaining subscribers. Fails
    /// with [`SluiceError::Completed`] once the distributor has shut down.
    pub async fn distribute(&self, publication: Publication<T>) -> Result<Demand> {
        if self.terminal.get().is_some() {
            return Err(SluiceError::Completed);
        }
        let (ack, demand) = Resumption::pair();
        match self.channel.offer(DistributorAction::Distribute { publication, ack }) {
            EnqueueStatus::Enqueued => demand.await,
            EnqueueStatus::Dropped(action) | EnqueueStatus::Terminated(action) => {
                action.release(&Completion::Cancelled);
                Err(SluiceError::Completed)
            }
        }
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> Result<usize> {
        let (reply, count) = Resumption::pair();
        match self.channel.offer(DistributorAction::Count(reply)) {
            EnqueueStatus::Enqueued => count.await,
            EnqueueStatus::Dropped(action) | EnqueueStatus::Terminated(action) => {
                action.release(&Completion::Cancelled);
                Ok(0)
            }
        }
    }

    /// The completion of the terminal round, once there was one.
    pub fn terminal(&self) -> Option<Completion> {
        self.terminal.get().cloned()
    }

    /// A publisher whose subscribers join this distributor.
    ///
    /// The subscription's startup signal fires once the subscriber is
    /// registered, so anything distributed afterwards reaches it.
    pub fn publisher(&self) -> Publisher<T> {
        let channel = self.channel.uncounted();
        let terminal = self.terminal.clone();
        Publisher::new(move |startup, downstream| {
            let (subscription, run) = Subscription::spawn(downstream, startup);
            if let Some(completion) = terminal.get() {
                subscription.reject(completion.clone());
                return run;
            }
            match channel.offer(DistributorAction::Subscribe(subscription)) {
                EnqueueStatus::Enqueued => {}
                EnqueueStatus::Dropped(action) | EnqueueStatus::Terminated(action) => {
                    action.release(terminal.get().unwrap_or(&Completion::Cancelled));
                }
            }
            run
        })
    }
}

// ============================================================================
// Distributor task
// ============================================================================

enum DistributorAction<T> {
    Subscribe(Subscription<T>),
    Distribute {
        publication: Publication<T>,
        ack: Resumption<Demand>,
    },
    Count(Resumption<usize>),
}

impl<T: Send + 'static> DistributorAction<T> {
    /// Settle an action that will never be reduced.
    fn release(self, terminal: &Completion) {
        match self {
            DistributorAction::Subscribe(subscription) => subscription.reject(terminal.clone()),
            DistributorAction::Distribute { ack, .. } => ack.resume(Demand::Cancel),
            DistributorAction::Count(reply) => reply.resume(0),
        }
    }
}

struct DistributorState<T> {
    repeaters: SmallVec<[(Uuid, Channel<Delivery<T>>); 4]>,
}

struct DistributorReducer<T> {
    terminal: Arc<OnceLock<Completion>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> DistributorReducer<T> {
    /// What late and leftover subscribers are told once the task is gone.
    fn terminal_for(&self, exit: &Completion) -> Completion {
        self.terminal
            .get_or_init(|| match exit {
                // Shut down without a terminal round.
                Completion::Finished => Completion::Cancelled,
                other => other.clone(),
            })
            .clone()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Reducer for DistributorReducer<T> {
    type State = DistributorState<T>;
    type Action = DistributorAction<T>;

    async fn reduce(
        &mut self,
        state: &mut DistributorState<T>,
        action: DistributorAction<T>,
    ) -> Result<Effect<DistributorAction<T>>> {
        match action {
            DistributorAction::Subscribe(subscription) => {
                if let Some(completion) = self.terminal.get() {
                    subscription.reject(completion.clone());
                } else {
                    tracing::trace!(subscriber = %subscription.id, "subscriber joined");
                    state.repeaters.push((subscription.id, subscription.channel));
                    resume_startup(subscription.startup);
                }
                Ok(Effect::None)
            }
            DistributorAction::Count(reply) => {
                reply.resume(state.repeaters.len());
                Ok(Effect::None)
            }
            DistributorAction::Distribute { publication, ack } => {
                if self.terminal.get().is_some() {
                    ack.resume(Demand::Cancel);
                    return Ok(Effect::None);
                }
                let terminal = match &publication {
                    Publication::Completion(completion) => Some(completion.clone()),
                    Publication::Value(_) => None,
                };
                let demand = round(state, publication).await?;
                match terminal {
                    Some(completion) => {
                        let _ = self.terminal.set(completion);
                        state.repeaters.clear();
                        ack.resume(Demand::Cancel);
                        Ok(Effect::Complete(Completion::Finished))
                    }
                    None => {
                        ack.resume(demand);
                        Ok(Effect::None)
                    }
                }
            }
        }
    }

    async fn dispose(&mut self, action: DistributorAction<T>, completion: &Completion) {
        action.release(&self.terminal_for(completion));
    }

    async fn finalize(&mut self, state: &mut DistributorState<T>, completion: &Completion) {
        let terminal = self.terminal_for(completion);
        for (_, channel) in state.repeaters.drain(..) {
            let _ = channel.offer(Delivery {
                publication: Publication::Completion(terminal.clone()),
                round: None,
            });
        }
    }
}

/// Run one broadcast round and prune subscribers that are done.
async fn round<T: Clone + Send + 'static>(
    state: &mut DistributorState<T>,
    publication: Publication<T>,
) -> Result<Demand> {
    if state.repeaters.is_empty() {
        return Ok(Demand::max(1));
    }

    let (semaphore, acks): (Round, _) = Semaphore::join(state.repeaters.len(), Acks::new(), |acks: &mut Acks, ack| {
        acks.push(ack)
    });
    for (id, channel) in &state.repeaters {
        let delivery = Delivery {
            publication: publication.clone(),
            round: Some(semaphore.clone()),
        };
        if let EnqueueStatus::Dropped(_) | EnqueueStatus::Terminated(_) = channel.offer(delivery) {
            semaphore.decrement((*id, Demand::Cancel));
        }
    }
    drop(semaphore);
    let acks = acks.await?;

    let gone: SmallVec<[Uuid; 4]> = acks
        .iter()
        .filter(|(_, demand)| demand.is_cancel())
        .map(|(id, _)| *id)
        .collect();
    if !gone.is_empty() {
        tracing::trace!(removed = gone.len(), "subscribers left after round");
        state.repeaters.retain(|(id, _)| !gone.contains(id));
    }

    Ok(acks
        .iter()
        .map(|(_, demand)| *demand)
        .filter(|demand| !demand.is_cancel())
        .reduce(narrower)
        .unwrap_or(Demand::max(1)))
}

/// The more restrictive of two non-cancel demands.
fn narrower(a: Demand, b: Demand) -> Demand {
    match (a.quantity(), b.quantity()) {
        (Some(x), Some(y)) => Demand::max(x.min(y)),
        (Some(_), None) => a,
        (None, _) => b,
    }
}

// ============================================================================
// Repeaters
// ============================================================================

/// A registered subscriber, on its way into the distributor.
struct Subscription<T> {
    id: Uuid,
    channel: Channel<Delivery<T>>,
    startup: Option<Resumption<()>>,
}

impl<T: Send + 'static> Subscription<T> {
    /// Start a repeater for `downstream`.
    #[track_caller]
    fn spawn(downstream: BoxSubscriber<T>, startup: Option<Resumption<()>>) -> (Self, Cancellable<Demand>) {
        let id = Uuid::new_v4();
        let (channel, mailbox) = channel(BufferPolicy::Unbounded);
        let task = StateTask::spawn_with(
            channel,
            mailbox,
            RepeaterState {
                downstream,
                last: Demand::None,
                terminated: false,
            },
            RepeaterReducer {
                id,
                _marker: PhantomData,
            },
        );
        let subscription = Subscription {
            id,
            channel: task.channel(),
            startup,
        };
        let run = task.into_cancellable().map(|repeater| repeater.last);
        (subscription, run)
    }

    /// Hand the subscriber `completion` instead of registering it.
    fn reject(self, completion: Completion) {
        let _ = self.channel.offer(Delivery {
            publication: Publication::Completion(completion),
            round: None,
        });
        resume_startup(self.startup);
    }
}

struct Delivery<T> {
    publication: Publication<T>,
    round: Option<Round>,
}

struct RepeaterState<T> {
    downstream: BoxSubscriber<T>,
    last: Demand,
    terminated: bool,
}

struct RepeaterReducer<T> {
    id: Uuid,
    _marker: PhantomData<fn(T)>,
}

impl<T> RepeaterReducer<T> {
    fn acknowledge(&self, round: Option<Round>, demand: Demand) {
        if let Some(round) = round {
            round.decrement((self.id, demand));
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Reducer for RepeaterReducer<T> {
    type State = RepeaterState<T>;
    type Action = Delivery<T>;

    async fn reduce(&mut self, state: &mut RepeaterState<T>, delivery: Delivery<T>) -> Result<Effect<Delivery<T>>> {
        let Delivery { publication, round } = delivery;
        if state.terminated {
            self.acknowledge(round, Demand::Cancel);
            return Ok(Effect::Complete(Completion::Finished));
        }
        let terminal = publication.is_completion();
        match state.downstream.receive(publication).await {
            Ok(demand) => {
                state.last = demand;
                if terminal || demand.is_cancel() {
                    state.terminated = true;
                    self.acknowledge(round, Demand::Cancel);
                    Ok(Effect::Complete(Completion::Finished))
                } else {
                    self.acknowledge(round, demand);
                    Ok(Effect::None)
                }
            }
            Err(error) => {
                state.terminated = true;
                self.acknowledge(round, Demand::Cancel);
                Err(error)
            }
        }
    }

    async fn dispose(&mut self, delivery: Delivery<T>, _completion: &Completion) {
        self.acknowledge(delivery.round, Demand::Cancel);
    }

    async fn finalize(&mut self, state: &mut RepeaterState<T>, _completion: &Completion) {
        if !state.terminated {
            state.terminated = true;
            let _ = state.downstream.receive(Publication::cancelled()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::{subscriber_fn, Subscriber};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log<T> = Arc<Mutex<Vec<Publication<T>>>>;

    fn answering<T: Send + 'static>(log: Log<T>, answer: impl Fn(usize) -> Demand + Send + 'static) -> impl Subscriber<T> {
        subscriber_fn(move |publication: Publication<T>| {
            let count = {
                let mut log = log.lock().unwrap();
                log.push(publication);
                log.len()
            };
            let demand = answer(count);
            async move { Ok(demand) }
        })
    }

    fn values<T: Clone>(log: &Log<T>) -> Vec<T> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|publication| publication.clone().value())
            .collect()
    }

    fn last_completion<T>(log: &Log<T>) -> Option<Completion> {
        log.lock().unwrap().iter().rev().find_map(|publication| match publication {
            Publication::Completion(completion) => Some(completion.clone()),
            Publication::Value(_) => None,
        })
    }

    async fn settled<T>(log: &Log<T>) -> Option<Completion> {
        for _ in 0..200 {
            if let Some(completion) = last_completion(log) {
                return Some(completion);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let distributor = Distributor::new();
        let first: Log<u32> = Arc::default();
        let second: Log<u32> = Arc::default();
        let first_run = distributor
            .publisher()
            .subscribe(answering(first.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();
        let second_run = distributor
            .publisher()
            .subscribe(answering(second.clone(), |_| Demand::max(2)))
            .await
            .unwrap();
        assert_eq!(distributor.subscriber_count().await.unwrap(), 2);

        assert_eq!(distributor.distribute(Publication::Value(1)).await.unwrap(), Demand::Max(2));
        distributor.distribute(Publication::Value(2)).await.unwrap();
        distributor.distribute(Publication::finished()).await.unwrap();

        assert_eq!(values(&first), vec![1, 2]);
        assert_eq!(values(&second), vec![1, 2]);
        assert!(last_completion(&first).unwrap().is_finished());
        assert_eq!(first_run.value().await.unwrap(), Demand::Unlimited);
        assert_eq!(second_run.value().await.unwrap(), Demand::Max(2));
    }

    #[tokio::test]
    async fn test_cancelling_subscriber_is_removed_after_round() {
        let distributor = Distributor::new();
        let quitter: Log<u32> = Arc::default();
        let stayer: Log<u32> = Arc::default();
        let quitter_run = distributor
            .publisher()
            .subscribe(answering(quitter.clone(), |_| Demand::Cancel))
            .await
            .unwrap();
        let stayer_run = distributor
            .publisher()
            .subscribe(answering(stayer.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();

        assert_eq!(distributor.distribute(Publication::Value(1)).await.unwrap(), Demand::Unlimited);
        assert_eq!(distributor.subscriber_count().await.unwrap(), 1);
        distributor.distribute(Publication::Value(2)).await.unwrap();
        distributor.distribute(Publication::finished()).await.unwrap();

        assert_eq!(values(&quitter), vec![1]);
        assert_eq!(values(&stayer), vec![1, 2]);
        assert_eq!(quitter_run.value().await.unwrap(), Demand::Cancel);
        stayer_run.value().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_subscribers_keeps_upstream_flowing() {
        let distributor = Distributor::<u8>::new();
        assert_eq!(distributor.distribute(Publication::Value(1)).await.unwrap(), Demand::Max(1));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_terminal_completion() {
        let distributor = Distributor::<u8>::new();
        distributor
            .distribute(Publication::failure(SluiceError::failure("source died")))
            .await
            .unwrap();
        assert!(distributor.terminal().is_some());

        let late: Log<u8> = Arc::default();
        let run = distributor
            .publisher()
            .subscribe(answering(late.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();
        run.value().await.unwrap();
        let completion = last_completion(&late).unwrap();
        assert_eq!(completion.failure().unwrap().to_string(), "source died");
        assert!(matches!(
            distributor.distribute(Publication::Value(1)).await,
            Err(SluiceError::Completed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_pruned() {
        let distributor = Distributor::new();
        let gone: Log<u32> = Arc::default();
        let run = distributor
            .publisher()
            .subscribe(answering(gone.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();
        run.cancel();
        assert!(matches!(run.value().await, Err(SluiceError::Cancelled)));
        assert!(settled(&gone).await.unwrap().is_cancelled());

        // The repeater is gone; the next round drops it.
        assert_eq!(distributor.distribute(Publication::Value(5)).await.unwrap(), Demand::Max(1));
        assert_eq!(distributor.subscriber_count().await.unwrap(), 0);
        assert!(values(&gone).is_empty());
    }

    #[test]
    fn test_narrower_demand() {
        assert_eq!(narrower(Demand::Unlimited, Demand::max(3)), Demand::Max(3));
        assert_eq!(narrower(Demand::max(2), Demand::max(5)), Demand::Max(2));
        assert_eq!(narrower(Demand::None, Demand::Unlimited), Demand::None);
        assert_eq!(narrower(Demand::Unlimited, Demand::Unlimited), Demand::Unlimited);
    }
}
