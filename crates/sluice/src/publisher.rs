//! Publishers: values that deliver supply to one downstream on demand.
//!
//! A publisher is cold: each subscription starts its own delivery and is
//! represented by a [`Cancellable<Demand>`] that completes with the last
//! demand the downstream declared. Nothing is buffered between a publisher
//! and its downstream; each value is handed over only after the previous one
//! was answered.
//!
//! ## Building a publisher
//!
//! ```ignore
//! let numbers = Publisher::new(|startup, mut downstream| {
//!     Cancellable::spawn(async move {
//!         resume_startup(startup);
//!         for n in 0..3 {
//!             if downstream.receive(Publication::Value(n)).await?.is_cancel() {
//!                 return Ok(Demand::Cancel);
//!             }
//!         }
//!         downstream.receive(Publication::finished()).await
//!     })
//! });
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cancellable::Cancellable;
use crate::demand::Demand;
use crate::error::{Result, SluiceError};
use crate::leak::LeakPolicy;
use crate::producer::{IterProducer, Producer};
use crate::publication::{Publication, Supply};
use crate::resumption::Resumption;
use crate::subscriber::{BoxSubscriber, Subscriber};

/// Something that can be subscribed to.
///
/// `startup`, when present, must be resumed exactly once as soon as delivery
/// has begun, so a caller can wait until the subscription is live before
/// pushing into a push-style source.
pub trait Publish<T: Send + 'static>: Send + Sync + 'static {
    fn subscribe_with(
        &self,
        startup: Option<Resumption<()>>,
        downstream: BoxSubscriber<T>,
    ) -> Cancellable<Demand>;
}

/// Resume a startup signal if one was passed.
pub fn resume_startup(startup: Option<Resumption<()>>) {
    if let Some(startup) = startup {
        startup.resume(());
    }
}

/// Cloneable handle over a [`Publish`] implementation.
pub struct Publisher<T> {
    source: Arc<dyn Publish<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

struct FnPublish<F, T> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<F, T> Publish<T> for FnPublish<F, T>
where
    T: Send + 'static,
    F: Fn(Option<Resumption<()>>, BoxSubscriber<T>) -> Cancellable<Demand> + Send + Sync + 'static,
{
    fn subscribe_with(
        &self,
        startup: Option<Resumption<()>>,
        downstream: BoxSubscriber<T>,
    ) -> Cancellable<Demand> {
        (self.f)(startup, downstream)
    }
}

impl<T: Send + 'static> Publisher<T> {
    /// Build a publisher from its subscription function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<Resumption<()>>, BoxSubscriber<T>) -> Cancellable<Demand> + Send + Sync + 'static,
    {
        Self::from_publish(FnPublish {
            f,
            _marker: PhantomData,
        })
    }

    pub fn from_publish<P: Publish<T>>(publish: P) -> Self {
        Self {
            source: Arc::new(publish),
        }
    }

    /// Start delivery to `downstream` without waiting for it to begin.
    pub fn subscribe_with(
        &self,
        startup: Option<Resumption<()>>,
        downstream: impl Subscriber<T>,
    ) -> Cancellable<Demand> {
        self.source.subscribe_with(startup, Box::new(downstream))
    }

    /// Start delivery to `downstream` and wait until it has begun.
    pub async fn subscribe(&self, downstream: impl Subscriber<T>) -> Result<Cancellable<Demand>> {
        // If this future is dropped early the subscription is cancelled,
        // which may drop the startup signal unresumed; that is not a leak.
        let (startup, started) = Resumption::pair_with_policy(LeakPolicy::SilentCancel);
        let pending = self.subscribe_with(Some(startup), downstream).cancel_on_drop();
        match started.await {
            Ok(()) => Ok(pending.disarm()),
            Err(error) => {
                pending.cancel();
                Err(error)
            }
        }
    }

    /// Subscribe and wait for delivery to end.
    pub async fn sink(&self, downstream: impl Subscriber<T>) -> Result<Demand> {
        self.subscribe(downstream).await?.value().await
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    /// A publisher driving a fresh producer per subscription.
    ///
    /// The first request is `Max(1)`. A downstream answering `Cancel` stops
    /// delivery for good; answering `None` yields to the scheduler before a
    /// single further unit is requested.
    pub fn from_producer<P, F>(make: F) -> Self
    where
        P: Producer<T> + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        Publisher::new(move |startup, downstream| {
            let producer = make();
            Cancellable::spawn(drive(producer, startup, downstream))
        })
    }

    /// Each subscription replays the values of `iter`, then finishes.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Publisher::from_producer(move || IterProducer::new(iter.clone()))
    }

    /// One value, then finished.
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Publisher::from_iter([value])
    }

    /// Finishes immediately.
    pub fn empty() -> Self {
        Publisher::new(|startup, mut downstream| {
            Cancellable::spawn(async move {
                resume_startup(startup);
                downstream.receive(Publication::finished()).await
            })
        })
    }

    /// Fails immediately with `error`.
    pub fn fail(error: SluiceError) -> Self {
        Publisher::new(move |startup, mut downstream| {
            let error = error.clone();
            Cancellable::spawn(async move {
                resume_startup(startup);
                downstream.receive(Publication::failure(error)).await
            })
        })
    }

    /// Never delivers anything and never completes on its own.
    pub fn never() -> Self {
        Publisher::new(|startup, downstream| {
            Cancellable::spawn(async move {
                resume_startup(startup);
                let _downstream = downstream;
                std::future::pending::<Result<Demand>>().await
            })
        })
    }
}

/// Pull `producer` one unit at a time and hand each unit to `downstream`.
///
/// A downstream that answers `None` is not asked again before the next
/// delivery: the driver yields once and then requests a single unit on its
/// behalf. A subscriber that needs a real pause holds its `receive` future
/// until it is ready.
async fn drive<T, P>(
    mut producer: P,
    startup: Option<Resumption<()>>,
    mut downstream: BoxSubscriber<T>,
) -> Result<Demand>
where
    T: Send + 'static,
    P: Producer<T>,
{
    resume_startup(startup);
    let mut demand = Demand::max(1);
    loop {
        match producer.produce(demand) {
            Supply::Value(value) => {
                demand = downstream.receive(Publication::Value(value)).await?;
                if demand.is_cancel() {
                    // Latch the producer so it never yields again.
                    let _ = producer.produce(Demand::Cancel);
                    return Ok(Demand::Cancel);
                }
            }
            Supply::Finished => return downstream.receive(Publication::finished()).await,
            Supply::Failure(error) => return downstream.receive(Publication::failure(error)).await,
            Supply::Pending => {
                tokio::task::yield_now().await;
                if !demand.has_room() {
                    demand = Demand::max(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publication::Completion;
    use crate::subscriber::subscriber_fn;
    use std::sync::{Arc, Mutex};

    type Log<T> = Arc<Mutex<Vec<Publication<T>>>>;

    /// Records everything and answers with the next scripted demand.
    fn recording<T: Send + 'static>(log: Log<T>, answer: impl Fn(usize) -> Demand + Send + 'static) -> impl Subscriber<T> {
        subscriber_fn(move |publication: Publication<T>| {
            let log = log.clone();
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
            .filter_map(|publication| match publication {
                Publication::Value(value) => Some(value.clone()),
                Publication::Completion(_) => None,
            })
            .collect()
    }

    fn completions<T>(log: &Log<T>) -> Vec<Completion> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|publication| match publication {
                Publication::Completion(completion) => Some(completion.clone()),
                Publication::Value(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sequence_with_unlimited_demand() {
        let log: Log<i32> = Arc::default();
        let publisher = Publisher::from_iter(vec![5, 4, 3, 2, 1, 0]);

        publisher
            .sink(recording(log.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();

        assert_eq!(values(&log), vec![5, 4, 3, 2, 1, 0]);
        let seen = completions(&log);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_finished());
    }

    #[tokio::test]
    async fn test_cancel_after_two_values() {
        let log: Log<i32> = Arc::default();
        let publisher = Publisher::from_iter(vec![5, 4, 3, 2, 1, 0]);

        let last = publisher
            .sink(recording(log.clone(), |count| {
                if count >= 2 {
                    Demand::Cancel
                } else {
                    Demand::max(1)
                }
            }))
            .await
            .unwrap();

        assert_eq!(last, Demand::Cancel);
        assert_eq!(values(&log), vec![5, 4]);
        assert!(completions(&log).is_empty());
    }

    #[tokio::test]
    async fn test_none_demand_resumes_after_yield() {
        let log: Log<u8> = Arc::default();
        Publisher::from_iter(vec![1u8, 2, 3])
            .sink(recording(log.clone(), |_| Demand::None))
            .await
            .unwrap();
        assert_eq!(values(&log), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_publisher_is_cold() {
        let publisher = Publisher::from_iter(vec!['a', 'b']);
        for _ in 0..2 {
            let log: Log<char> = Arc::default();
            publisher
                .sink(recording(log.clone(), |_| Demand::Unlimited))
                .await
                .unwrap();
            assert_eq!(values(&log), vec!['a', 'b']);
        }
    }

    #[tokio::test]
    async fn test_fail_and_empty() {
        let log: Log<u8> = Arc::default();
        Publisher::fail(SluiceError::failure("bad source"))
            .sink(recording(log.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();
        let seen = completions(&log);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].failure().unwrap().to_string(), "bad source");

        let log: Log<u8> = Arc::default();
        Publisher::empty()
            .sink(recording(log.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();
        assert!(values(&log).is_empty());
        assert!(completions(&log)[0].is_finished());
    }

    #[tokio::test]
    async fn test_subscriber_error_ends_subscription() {
        let publisher = Publisher::from_iter(vec![1, 2, 3]);
        let outcome = publisher
            .sink(subscriber_fn(|_publication: Publication<i32>| async {
                Err(SluiceError::failure("downstream refused"))
            }))
            .await;
        assert_eq!(outcome.unwrap_err().to_string(), "downstream refused");
    }

    #[tokio::test]
    async fn test_never_can_be_cancelled() {
        let log: Log<u8> = Arc::default();
        let subscription = Publisher::never()
            .subscribe(recording(log.clone(), |_| Demand::Unlimited))
            .await
            .unwrap();
        subscription.cancel();
        assert!(matches!(subscription.value().await, Err(SluiceError::Cancelled)));
        assert!(log.lock().unwrap().is_empty());
    }
}
