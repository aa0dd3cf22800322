//! The downstream side of the backpressure protocol.

use std::future::Future;

use async_trait::async_trait;

use crate::demand::Demand;
use crate::error::Result;
use crate::publication::Publication;

/// Consumes one publication at a time and answers with its next demand.
///
/// Answering [`Demand::None`] means "nothing more right now"; answering
/// [`Demand::Cancel`] is terminal. An error terminates the stream feeding
/// this subscriber.
#[async_trait]
pub trait Subscriber<T: Send + 'static>: Send + 'static {
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand>;
}

/// Boxed subscriber, the form publishers are handed.
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

#[async_trait]
impl<T, S> Subscriber<T> for Box<S>
where
    T: Send + 'static,
    S: Subscriber<T> + ?Sized,
{
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        (**self).receive(publication).await
    }
}

/// Subscriber backed by a closure returning a future.
pub struct FnSubscriber<F> {
    f: F,
}

/// Adapt a closure into a [`Subscriber`].
///
/// ```ignore
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = subscriber_fn({
///     let seen = seen.clone();
///     move |publication| {
///         let seen = seen.clone();
///         async move {
///             if let Publication::Value(value) = publication {
///                 seen.lock().unwrap().push(value);
///             }
///             Ok(Demand::Unlimited)
///         }
///     }
/// });
/// ```
pub fn subscriber_fn<T, F, Fut>(f: F) -> FnSubscriber<F>
where
    T: Send + 'static,
    F: FnMut(Publication<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Demand>> + Send + 'static,
{
    FnSubscriber { f }
}

#[async_trait]
impl<T, F, Fut> Subscriber<T> for FnSubscriber<F>
where
    T: Send + 'static,
    F: FnMut(Publication<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Demand>> + Send + 'static,
{
    async fn receive(&mut self, publication: Publication<T>) -> Result<Demand> {
        (self.f)(publication).await
    }
}
