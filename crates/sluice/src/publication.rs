//! Units of stream output.
//!
//! - [`Supply`] is what a [`Producer`](crate::Producer) hands out per demand step
//! - [`Publication`] is what a [`Subscriber`](crate::Subscriber) receives
//!
//! Once a stream has delivered a [`Completion`] it never delivers another value.

use crate::error::SluiceError;

/// How a stream ended.
#[derive(Debug, Clone)]
pub enum Completion {
    Finished,
    Failure(SluiceError),
    Cancelled,
}

impl Completion {
    pub fn is_finished(&self) -> bool {
        matches!(self, Completion::Finished)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled)
    }

    /// The error carried by a failure.
    pub fn failure(&self) -> Option<&SluiceError> {
        match self {
            Completion::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Classify the outcome of a task that ended with `result`.
    pub fn from_result<T>(result: &Result<T, SluiceError>) -> Self {
        match result {
            Ok(_) => Completion::Finished,
            Err(error) if error.is_cancellation() => Completion::Cancelled,
            Err(error) => Completion::Failure(error.clone()),
        }
    }
}

/// One unit delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum Publication<T> {
    Value(T),
    Completion(Completion),
}

impl<T> Publication<T> {
    pub const fn finished() -> Self {
        Publication::Completion(Completion::Finished)
    }

    pub const fn cancelled() -> Self {
        Publication::Completion(Completion::Cancelled)
    }

    pub fn failure(error: SluiceError) -> Self {
        Publication::Completion(Completion::Failure(error))
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, Publication::Completion(_))
    }

    pub fn value(self) -> Option<T> {
        match self {
            Publication::Value(value) => Some(value),
            Publication::Completion(_) => None,
        }
    }

    /// Re-shape the value, keeping completions as they are.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Publication<U> {
        match self {
            Publication::Value(value) => Publication::Value(f(value)),
            Publication::Completion(completion) => Publication::Completion(completion),
        }
    }
}

/// One unit handed out by a producer for one demand step.
#[derive(Debug, Clone)]
pub enum Supply<T> {
    Value(T),
    Failure(SluiceError),
    Finished,
    /// Nothing available yet; demand is not extinguished.
    Pending,
}

impl<T> Supply<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Supply::Failure(_) | Supply::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_keeps_completion() {
        let value: Publication<u32> = Publication::Value(2);
        assert!(matches!(value.map(|n| n * 2), Publication::Value(4)));

        let done: Publication<u32> = Publication::finished();
        assert!(matches!(
            done.map(|n| n * 2),
            Publication::Completion(Completion::Finished)
        ));
    }

    #[test]
    fn test_completion_from_result() {
        assert!(Completion::from_result(&Ok::<_, SluiceError>(1)).is_finished());
        assert!(Completion::from_result::<()>(&Err(SluiceError::Cancelled)).is_cancelled());
        let failed = Completion::from_result::<()>(&Err(SluiceError::failure("x")));
        assert_eq!(failed.failure().map(ToString::to_string).as_deref(), Some("x"));
    }

    #[test]
    fn test_supply_terminal() {
        assert!(Supply::<u8>::Finished.is_terminal());
        assert!(Supply::<u8>::Failure(SluiceError::Completed).is_terminal());
        assert!(!Supply::<u8>::Pending.is_terminal());
        assert!(!Supply::Value(1u8).is_terminal());
    }
}
