//! Shared, connectable subscription to one upstream.
//!
//! A [`Multicaster`] subscribes to its upstream only when told to
//! [`connect`](Multicaster::connect), and hands every upstream publication
//! to a [`Distributor`]. Downstreams join through [`Multicaster::publisher`]
//! whether or not the upstream is connected yet.
//!
//! Controls:
//!
//! - `connect` / `disconnect` start and cancel the upstream subscription
//! - `pause` / `resume` hold upstream delivery without cancelling it
//!
//! Once the upstream completes the multicaster is spent: `connect` fails
//! with [`SluiceError::Completed`] and `disconnect` with
//! [`SluiceError::NotConnected`].
//!
//! Control state lives in a [`StateTask`]; the upstream subscriber asks that
//! task for permission before each delivery, so a slow round never blocks a
//! control request.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cancellable::CancelOnDrop;
use crate::channel::{channel, BufferPolicy, Channel, EnqueueStatus};
use crate::demand::Demand;
use crate::distributor::Distributor;
use crate::error::{Result, SluiceError};
use crate::publication::{Completion, Publication};
use crate::publisher::Publisher;
use crate::resumption::Resumption;
use crate::state_task::{Effect, Reducer, StateTask};
use crate::subscriber::Subscriber;

/// Connectable fan-out over one upstream publisher.
pub struct Multicaster<T> {
    channel: Channel<Control>,
    distributor: Distributor<T>,
    _task: Arc<CancelOnDrop<Connection>>,
}

impl<T> Clone for Multicaster<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            distributor: self.distributor.clone(),
            _task: self._task.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Multicaster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multicaster")
            .field("distributor", &self.distributor)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Multicaster<T> {
    #[track_caller]
    pub fn new(upstream: Publisher<T>) -> Self {
        let distributor = Distributor::new();
        let (channel, mailbox) = channel(BufferPolicy::Unbounded);
        let feed = Feed {
            gate: channel.uncounted(),
            distributor: distributor.clone(),
        };
        let task = StateTask::spawn_with(
            channel,
            mailbox,
            Connection::default(),
            Controller { upstream, feed },
        );
        Self {
            channel: task.channel(),
            distributor,
            _task: Arc::new(task.into_cancellable().cancel_on_drop()),
        }
    }

    /// Subscribe to the upstream.
    ///
    /// Fails with [`SluiceError::AlreadyConnected`] if already connected, or
    /// [`SluiceError::Completed`] if the upstream has already completed.
    pub async fn connect(&self) -> Result<()> {
        self.control(Control::Connect).await
    }

    /// Cancel the upstream subscription.
    ///
    /// Fails with [`SluiceError::NotConnected`] if not connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.control(Control::Disconnect).await
    }

    /// Hold upstream deliveries until [`resume`](Self::resume).
    pub async fn pause(&self) -> Result<()> {
        self.control(Control::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.control(Control::Resume).await
    }

    /// A publisher whose subscribers share this multicaster's upstream.
    pub fn publisher(&self) -> Publisher<T> {
        self.distributor.publisher()
    }

    async fn control(&self, request: fn(Resumption<()>) -> Control) -> Result<()> {
        let (ack, done) = Resumption::pair();
        match self.channel.offer(request(ack)) {
            EnqueueStatus::Enqueued => done.await,
            EnqueueStatus::Dropped(control) | EnqueueStatus::Terminated(control) => {
                control.release();
                Err(SluiceError::Completed)
            }
        }
    }
}

impl<T: Clone + Send + 'static> Publisher<T> {
    /// Share this publisher through a [`Multicaster`].
    #[track_caller]
    pub fn multicast(&self) -> Multicaster<T> {
        Multicaster::new(self.clone())
    }
}

// ============================================================================
// Control task
// ============================================================================

enum Control {
    Connect(Resumption<()>),
    Disconnect(Resumption<()>),
    Pause(Resumption<()>),
    Resume(Resumption<()>),
    /// Upstream asks whether it may deliver; `false` means stop.
    Gate(Resumption<bool>),
    /// The upstream delivered its completion.
    Ended,
}

impl Control {
    fn release(self) {
        match self {
            Control::Connect(ack)
            | Control::Disconnect(ack)
            | Control::Pause(ack)
            | Control::Resume(ack) => ack.cancel(),
            Control::Gate(permit) => permit.resume(false),
            Control::Ended => {}
        }
    }
}

#[derive(Default)]
struct Connection {
    upstream: Option<CancelOnDrop<Demand>>,
    paused: bool,
    held: Option<Resumption<bool>>,
    ended: bool,
}

impl Connection {
    fn release_held(&mut self, permit: bool) {
        if let Some(held) = self.held.take() {
            held.resume(permit);
        }
    }
}

struct Controller<T> {
    upstream: Publisher<T>,
    feed: Feed<T>,
}

#[async_trait]
impl<T: Clone + Send + 'static> Reducer for Controller<T> {
    type State = Connection;
    type Action = Control;

    async fn reduce(&mut self, connection: &mut Connection, control: Control) -> Result<Effect<Control>> {
        match control {
            Control::Connect(ack) => {
                if connection.upstream.is_some() {
                    ack.resume_throwing(SluiceError::AlreadyConnected);
                } else if connection.ended {
                    ack.resume_throwing(SluiceError::Completed);
                } else {
                    tracing::debug!("multicaster connecting");
                    let run = self.upstream.subscribe_with(None, self.feed.clone());
                    connection.upstream = Some(run.cancel_on_drop());
                    ack.resume(());
                }
            }
            Control::Disconnect(ack) => match connection.upstream.take() {
                Some(run) => {
                    tracing::debug!("multicaster disconnecting");
                    run.cancel();
                    connection.release_held(false);
                    ack.resume(());
                }
                None => ack.resume_throwing(SluiceError::NotConnected),
            },
            Control::Pause(ack) => {
                tracing::debug!("multicaster paused");
                connection.paused = true;
                ack.resume(());
            }
            Control::Resume(ack) => {
                tracing::debug!("multicaster resumed");
                connection.paused = false;
                connection.release_held(true);
                ack.resume(());
            }
            Control::Gate(permit) => {
                if connection.upstream.is_none() {
                    permit.resume(false);
                } else if connection.paused {
                    connection.release_held(false);
                    connection.held = Some(permit);
                } else {
                    permit.resume(true);
                }
            }
            Control::Ended => {
                tracing::debug!("multicaster upstream ended");
                connection.ended = true;
                connection.upstream = None;
                connection.release_held(false);
            }
        }
        Ok(Effect::None)
    }

    async fn dispose(&mut self, control: Control, _completion: &Completion) {
        control.release();
    }

    async fn finalize(&mut self, connection: &mut Connection, _completion: &Completion) {
        connection.release_held(false);
        connection.upstream = None;
    }
}

/// Upstream subscriber: waits for the gate, then runs one distribution round.
struct Feed<T> {
    gate: Channel<Control>,
    distributor: Distributor<T>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            distributor: self.distributor.clone(),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Subscriber<T> for Feed<T> {
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        let (permit, allowed) = Resumption::pair();
        if let EnqueueStatus::Dropped(control) | EnqueueStatus::Terminated(control) =
            self.gate.offer(Control::Gate(permit))
        {
            control.release();
        }
        if !allowed.await? {
            return Ok(Demand::Cancel);
        }
        let terminal = publication.is_completion();
        let outcome = match self.distributor.distribute(publication).await {
            Err(SluiceError::Completed) => Ok(Demand::Cancel),
            outcome => outcome,
        };
        if terminal {
            if let EnqueueStatus::Dropped(control) | EnqueueStatus::Terminated(control) =
                self.gate.offer(Control::Ended)
            {
                control.release();
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publication::Supply;
    use crate::subscriber::subscriber_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log<T> = Arc<Mutex<Vec<Publication<T>>>>;

    fn unlimited<T: Send + 'static>(log: Log<T>) -> impl Subscriber<T> {
        subscriber_fn(move |publication: Publication<T>| {
            log.lock().unwrap().push(publication);
            async { Ok(Demand::Unlimited) }
        })
    }

    fn values<T: Clone>(log: &Log<T>) -> Vec<T> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|publication| publication.clone().value())
            .collect()
    }

    /// Counts how often the upstream is asked for a value.
    fn counting(limit: u32, pulls: Arc<AtomicUsize>) -> Publisher<u32> {
        Publisher::from_producer(move || {
            let pulls = pulls.clone();
            let mut next = 0;
            move |demand: Demand| {
                if !demand.has_room() {
                    return Supply::Pending;
                }
                pulls.fetch_add(1, Ordering::SeqCst);
                next += 1;
                if next > limit {
                    Supply::Finished
                } else {
                    Supply::Value(next)
                }
            }
        })
    }

    async fn wait_for_completion<T>(log: &Log<T>) {
        for _ in 0..200 {
            if log.lock().unwrap().iter().any(Publication::is_completion) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no completion arrived");
    }

    #[tokio::test]
    async fn test_upstream_is_pulled_only_after_connect() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let multicaster = counting(3, pulls.clone()).multicast();

        let first: Log<u32> = Arc::default();
        let second: Log<u32> = Arc::default();
        let first_run = multicaster.publisher().subscribe(unlimited(first.clone())).await.unwrap();
        let second_run = multicaster.publisher().subscribe(unlimited(second.clone())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        multicaster.connect().await.unwrap();
        wait_for_completion(&first).await;
        wait_for_completion(&second).await;
        assert_eq!(values(&first), vec![1, 2, 3]);
        assert_eq!(values(&second), vec![1, 2, 3]);
        first_run.value().await.unwrap();
        second_run.value().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_errors() {
        let multicaster = Publisher::<u32>::never().multicast();
        assert!(matches!(multicaster.disconnect().await, Err(SluiceError::NotConnected)));
        multicaster.connect().await.unwrap();
        assert!(matches!(multicaster.connect().await, Err(SluiceError::AlreadyConnected)));
        multicaster.disconnect().await.unwrap();
        assert!(matches!(multicaster.disconnect().await, Err(SluiceError::NotConnected)));
    }

    #[tokio::test]
    async fn test_pause_holds_delivery_until_resume() {
        let multicaster = Publisher::from_iter(vec![10, 20, 30]).multicast();
        let log: Log<i32> = Arc::default();
        let run = multicaster.publisher().subscribe(unlimited(log.clone())).await.unwrap();

        multicaster.pause().await.unwrap();
        multicaster.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(log.lock().unwrap().is_empty());

        multicaster.resume().await.unwrap();
        wait_for_completion(&log).await;
        assert_eq!(values(&log), vec![10, 20, 30]);
        run.value().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_stops_upstream() {
        let multicaster = Publisher::from_iter(0u64..).multicast();
        let log: Log<u64> = Arc::default();
        let run = multicaster.publisher().subscribe(unlimited(log.clone())).await.unwrap();

        multicaster.connect().await.unwrap();
        for _ in 0..200 {
            if log.lock().unwrap().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        multicaster.disconnect().await.unwrap();
        // A round already past the gate may still land.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = log.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.lock().unwrap().len(), settled);
        assert!(settled >= 3);
        run.cancel();
        assert!(matches!(run.value().await, Err(SluiceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_completed_upstream_cannot_reconnect() {
        let multicaster = Publisher::from_iter(vec![1, 2]).multicast();
        let log: Log<i32> = Arc::default();
        let run = multicaster.publisher().subscribe(unlimited(log.clone())).await.unwrap();

        multicaster.connect().await.unwrap();
        run.value().await.unwrap();
        assert_eq!(values(&log), vec![1, 2]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(multicaster.connect().await, Err(SluiceError::Completed)));
        assert!(matches!(multicaster.disconnect().await, Err(SluiceError::NotConnected)));
    }
}
