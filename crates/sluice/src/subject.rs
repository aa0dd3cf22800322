//! Push-style source.
//!
//! A [`Subject`] lets ordinary code push values into a stream. Every push is
//! one [`Distributor`] round: it returns once all current subscribers have
//! answered, with the narrowest demand among them.
//!
//! Because [`Publisher::subscribe`](crate::Publisher::subscribe) returns only
//! once the subscriber is registered, a value sent after `subscribe`
//! returns is never missed by that subscriber.

use crate::demand::Demand;
use crate::distributor::Distributor;
use crate::error::{Result, SluiceError};
use crate::publication::Publication;
use crate::publisher::Publisher;

pub struct Subject<T> {
    distributor: Distributor<T>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            distributor: self.distributor.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("distributor", &self.distributor)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    #[track_caller]
    pub fn new() -> Self {
        Self {
            distributor: Distributor::new(),
        }
    }

    /// Push one value to every subscriber.
    pub async fn send(&self, value: T) -> Result<Demand> {
        self.distributor.distribute(Publication::Value(value)).await
    }

    /// Complete the stream. Later subscribers see the same completion.
    pub async fn finish(&self) -> Result<()> {
        self.distributor
            .distribute(Publication::finished())
            .await
            .map(drop)
    }

    /// Fail the stream with `error`.
    pub async fn fail(&self, error: SluiceError) -> Result<()> {
        self.distributor
            .distribute(Publication::failure(error))
            .await
            .map(drop)
    }

    pub fn publisher(&self) -> Publisher<T> {
        self.distributor.publisher()
    }

    pub async fn subscriber_count(&self) -> Result<usize> {
        self.distributor.subscriber_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publication::Completion;
    use crate::subscriber::{subscriber_fn, Subscriber};
    use std::sync::{Arc, Mutex};

    type Log<T> = Arc<Mutex<Vec<Publication<T>>>>;

    fn unlimited<T: Send + 'static>(log: Log<T>) -> impl Subscriber<T> {
        subscriber_fn(move |publication: Publication<T>| {
            log.lock().unwrap().push(publication);
            async { Ok(Demand::Unlimited) }
        })
    }

    fn completion<T>(log: &Log<T>) -> Option<Completion> {
        log.lock().unwrap().iter().find_map(|publication| match publication {
            Publication::Completion(completion) => Some(completion.clone()),
            Publication::Value(_) => None,
        })
    }

    #[tokio::test]
    async fn test_subscribe_then_send_is_never_missed() {
        let subject = Subject::new();
        let log: Log<&'static str> = Arc::default();
        let run = subject.publisher().subscribe(unlimited(log.clone())).await.unwrap();

        assert_eq!(subject.send("hello").await.unwrap(), Demand::Unlimited);
        subject.send("world").await.unwrap();
        subject.finish().await.unwrap();
        run.value().await.unwrap();

        let values: Vec<_> = log.lock().unwrap().iter().filter_map(|p| p.clone().value()).collect();
        assert_eq!(values, vec!["hello", "world"]);
        assert!(completion(&log).unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_send_after_finish_fails() {
        let subject = Subject::<u8>::new();
        subject.finish().await.unwrap();
        assert!(matches!(subject.send(1).await, Err(SluiceError::Completed)));

        let late: Log<u8> = Arc::default();
        subject
            .publisher()
            .subscribe(unlimited(late.clone()))
            .await
            .unwrap()
            .value()
            .await
            .unwrap();
        assert!(completion(&late).unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_fail_reaches_subscribers() {
        let subject = Subject::<u8>::new();
        let log: Log<u8> = Arc::default();
        let run = subject.publisher().subscribe(unlimited(log.clone())).await.unwrap();
        assert_eq!(subject.subscriber_count().await.unwrap(), 1);

        subject.fail(SluiceError::failure("sensor offline")).await.unwrap();
        run.value().await.unwrap();
        assert_eq!(
            completion(&log).unwrap().failure().unwrap().to_string(),
            "sensor offline"
        );
    }

    #[tokio::test]
    async fn test_send_without_subscribers() {
        let subject = Subject::new();
        assert_eq!(subject.send(1u32).await.unwrap(), Demand::max(1));
    }
}
