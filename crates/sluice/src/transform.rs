//! Stateless operators over publishers.
//!
//! Each operator wraps the downstream subscriber and subscribes the wrapper
//! to the upstream publisher; no task is spawned beyond what the upstream
//! and inner publishers already run. Cancelling the resulting subscription
//! cancels the upstream delivery and, for [`Publisher::flat_map`], whichever
//! inner publisher is currently running.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::demand::Demand;
use crate::error::Result;
use crate::publication::{Completion, Publication};
use crate::publisher::Publisher;
use crate::subscriber::{BoxSubscriber, Subscriber};

impl<T: Send + 'static> Publisher<T> {
    /// Apply `f` to every value.
    pub fn map<U, F>(&self, f: F) -> Publisher<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let f = Arc::new(f);
        Publisher::new(move |startup, downstream| {
            upstream.subscribe_with(
                startup,
                Map {
                    f: f.clone(),
                    downstream,
                    terminated: false,
                },
            )
        })
    }

    /// Forward only the values for which `predicate` holds.
    ///
    /// A discarded value is answered with the downstream's last demand, so
    /// the upstream keeps delivering.
    pub fn filter<F>(&self, predicate: F) -> Publisher<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let predicate = Arc::new(predicate);
        Publisher::new(move |startup, downstream| {
            upstream.subscribe_with(
                startup,
                Filter {
                    predicate: predicate.clone(),
                    downstream,
                    last: Demand::max(1),
                    terminated: false,
                },
            )
        })
    }

    /// Replace every value with a publisher and deliver its values in turn.
    ///
    /// Inner publishers run one at a time. An inner failure terminates the
    /// whole stream; an inner finish only moves on to the next outer value.
    pub fn flat_map<U, F>(&self, f: F) -> Publisher<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Publisher<U> + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let f = Arc::new(f);
        Publisher::new(move |startup, downstream| {
            upstream.subscribe_with(
                startup,
                FlatMap {
                    f: f.clone(),
                    shared: Arc::new(Mutex::new(Shared {
                        downstream,
                        last: Demand::max(1),
                        terminated: false,
                    })),
                },
            )
        })
    }
}

// ============================================================================
// map
// ============================================================================

struct Map<F, U> {
    f: Arc<F>,
    downstream: BoxSubscriber<U>,
    terminated: bool,
}

#[async_trait]
impl<T, U, F> Subscriber<T> for Map<F, U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        if self.terminated {
            return Ok(Demand::Cancel);
        }
        if publication.is_completion() {
            self.terminated = true;
        }
        let demand = self.downstream.receive(publication.map(|value| (self.f)(value))).await?;
        if demand.is_cancel() {
            self.terminated = true;
        }
        Ok(demand)
    }
}

// ============================================================================
// filter
// ============================================================================

struct Filter<F, T> {
    predicate: Arc<F>,
    downstream: BoxSubscriber<T>,
    last: Demand,
    terminated: bool,
}

#[async_trait]
impl<T, F> Subscriber<T> for Filter<F, T>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        if self.terminated {
            return Ok(Demand::Cancel);
        }
        match publication {
            Publication::Value(value) if !(self.predicate)(&value) => {
                if self.last.has_room() {
                    Ok(self.last)
                } else {
                    Ok(Demand::max(1))
                }
            }
            publication => {
                if publication.is_completion() {
                    self.terminated = true;
                }
                let demand = self.downstream.receive(publication).await?;
                if demand.is_cancel() {
                    self.terminated = true;
                }
                self.last = demand;
                Ok(demand)
            }
        }
    }
}

// ============================================================================
// flat_map
// ============================================================================

struct Shared<U> {
    downstream: BoxSubscriber<U>,
    last: Demand,
    terminated: bool,
}

impl<U: Send + 'static> Shared<U> {
    async fn deliver(&mut self, publication: Publication<U>) -> Result<Demand> {
        if self.terminated {
            return Ok(Demand::Cancel);
        }
        if publication.is_completion() {
            self.terminated = true;
        }
        let demand = self.downstream.receive(publication).await?;
        if demand.is_cancel() {
            self.terminated = true;
        }
        self.last = demand;
        Ok(demand)
    }

    /// What to ask of a publisher after a step that delivered nothing.
    fn resume_demand(&self) -> Demand {
        if self.terminated {
            Demand::Cancel
        } else if self.last.has_room() {
            self.last
        } else {
            Demand::max(1)
        }
    }
}

struct FlatMap<F, U> {
    f: Arc<F>,
    shared: Arc<Mutex<Shared<U>>>,
}

#[async_trait]
impl<T, U, F> Subscriber<T> for FlatMap<F, U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Publisher<U> + Send + Sync + 'static,
{
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        match publication {
            Publication::Value(value) => {
                if self.shared.lock().await.terminated {
                    return Ok(Demand::Cancel);
                }
                let inner = (self.f)(value);
                let forward = Forward {
                    shared: self.shared.clone(),
                };
                // Dropping this future (outer cancelled) cancels the inner run.
                inner.subscribe_with(None, forward).cancel_on_drop().value().await?;
                Ok(self.shared.lock().await.resume_demand())
            }
            Publication::Completion(completion) => {
                self.shared
                    .lock()
                    .await
                    .deliver(Publication::Completion(completion))
                    .await
            }
        }
    }
}

/// Feeds one inner publisher into the shared downstream.
struct Forward<U> {
    shared: Arc<Mutex<Shared<U>>>,
}

#[async_trait]
impl<U: Send + 'static> Subscriber<U> for Forward<U> {
    async fn receive(&mut self, publication: Publication<U>) -> Result<Demand> {
        let mut shared = self.shared.lock().await;
        match publication {
            Publication::Completion(Completion::Finished) => Ok(shared.resume_demand()),
            publication => shared.deliver(publication).await,
        }
    }
}
