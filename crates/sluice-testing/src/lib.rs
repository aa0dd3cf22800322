//! # Sluice Testing
//!
//! Recording subscribers and stream assertions for tests of pipelines built
//! on Sluice.
//!
//! ## Example
//!
//! ```ignore
//! use sluice::Publisher;
//! use sluice_testing::record;
//!
//! #[tokio::test]
//! async fn test_doubles() {
//!     let recording = record(&Publisher::from_iter(1..=3).map(|n| n * 2)).await.unwrap();
//!     recording.assert_values(&[2, 4, 6]);
//!     recording.assert_finished();
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sluice::{Completion, Demand, Publication, Publisher, Subscriber};

/// How long [`record`] waits for a stream to complete.
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Demand scripts
// ============================================================================

/// The answers a [`Recorder`] gives, one per received value.
#[derive(Debug, Clone)]
pub enum DemandScript {
    /// Give the same answer every time.
    Always(Demand),
    /// Answer from the list in order, then repeat the last entry.
    Sequence(VecDeque<Demand>),
    /// Answer `Max(1)` until `n` values have arrived, then `Cancel`.
    CancelAfter(usize),
}

impl DemandScript {
    pub fn sequence(demands: impl IntoIterator<Item = Demand>) -> Self {
        Self::Sequence(demands.into_iter().collect())
    }

    fn answer(&mut self, received: usize) -> Demand {
        match self {
            DemandScript::Always(demand) => *demand,
            DemandScript::Sequence(demands) if demands.len() > 1 => {
                demands.pop_front().unwrap_or(Demand::Cancel)
            }
            DemandScript::Sequence(demands) => demands.front().copied().unwrap_or(Demand::Cancel),
            DemandScript::CancelAfter(limit) if received >= *limit => Demand::Cancel,
            DemandScript::CancelAfter(_) => Demand::max(1),
        }
    }
}

impl Default for DemandScript {
    fn default() -> Self {
        Self::Always(Demand::Unlimited)
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// A subscriber that keeps every publication it receives.
pub struct Recorder<T> {
    recording: Recording<T>,
    script: DemandScript,
}

impl<T: Send + 'static> Recorder<T> {
    /// A recorder and the handle used to inspect what it received.
    pub fn new(script: DemandScript) -> (Self, Recording<T>) {
        let recording = Recording::default();
        (
            Self {
                recording: recording.clone(),
                script,
            },
            recording,
        )
    }
}

#[async_trait]
impl<T: Send + 'static> Subscriber<T> for Recorder<T> {
    async fn receive(&mut self, publication: Publication<T>) -> sluice::Result<Demand> {
        let completion = publication.is_completion();
        let received = {
            let mut log = self.recording.lock();
            log.push(publication);
            log.iter().filter(|p| !p.is_completion()).count()
        };
        if completion {
            return Ok(Demand::Cancel);
        }
        Ok(self.script.answer(received))
    }
}

/// Shared view of what a [`Recorder`] has received so far.
pub struct Recording<T> {
    log: Arc<Mutex<Vec<Publication<T>>>>,
}

impl<T> Clone for Recording<T> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
        }
    }
}

impl<T> Default for Recording<T> {
    fn default() -> Self {
        Self {
            log: Arc::default(),
        }
    }
}

impl<T> Recording<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<Publication<T>>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.lock()
            .iter()
            .filter_map(|publication| match publication {
                Publication::Completion(completion) => Some(completion.clone()),
                Publication::Value(_) => None,
            })
            .collect()
    }

    /// The first completion received, if any.
    pub fn completion(&self) -> Option<Completion> {
        self.completions().into_iter().next()
    }

    /// Poll until a completion arrives or `timeout` elapses.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<Completion> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(completion) = self.completion() {
                    return completion;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("no completion within {:?}", timeout))
    }

    /// Panics unless the log is values followed by exactly one completion,
    /// or values only.
    #[track_caller]
    pub fn assert_well_formed(&self) {
        let log = self.lock();
        let completions = log.iter().filter(|p| p.is_completion()).count();
        assert!(completions <= 1, "expected at most one completion, got {}", completions);
        if completions == 1 {
            assert!(
                log.last().is_some_and(Publication::is_completion),
                "a value arrived after the completion"
            );
        }
    }

    #[track_caller]
    pub fn assert_finished(&self) {
        self.assert_well_formed();
        match self.completion() {
            Some(Completion::Finished) => {}
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled(&self) {
        self.assert_well_formed();
        match self.completion() {
            Some(Completion::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    /// Panics unless the stream failed with a message containing `needle`.
    #[track_caller]
    pub fn assert_failed_with(&self, needle: &str) {
        self.assert_well_formed();
        match self.completion() {
            Some(Completion::Failure(error)) => assert!(
                error.to_string().contains(needle),
                "expected failure containing {:?}, got {:?}",
                needle,
                error.to_string()
            ),
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_no_completion(&self) {
        let completions = self.completions();
        assert!(completions.is_empty(), "expected no completion, got {:?}", completions);
    }
}

impl<T: Clone> Recording<T> {
    pub fn values(&self) -> Vec<T> {
        self.lock()
            .iter()
            .filter_map(|publication| publication.clone().value())
            .collect()
    }
}

impl<T: Clone + PartialEq + std::fmt::Debug> Recording<T> {
    #[track_caller]
    pub fn assert_values(&self, expected: &[T]) {
        assert_eq!(self.values(), expected);
    }
}

// ============================================================================
// Driving publishers
// ============================================================================

/// Run `publisher` to completion with unlimited demand and return what it sent.
pub async fn record<T: Send + 'static>(publisher: &Publisher<T>) -> Result<Recording<T>> {
    record_with(publisher, DemandScript::default())
        .await
        .map(|(recording, _)| recording)
}

/// Run `publisher` with scripted demand.
///
/// Returns the recording and the last demand the subscription reported.
pub async fn record_with<T: Send + 'static>(
    publisher: &Publisher<T>,
    script: DemandScript,
) -> Result<(Recording<T>, Demand)> {
    let (recorder, recording) = Recorder::new(script);
    let last = tokio::time::timeout(DEFAULT_RECORD_TIMEOUT, publisher.sink(recorder))
        .await
        .map_err(|_| anyhow!("stream did not complete within {:?}", DEFAULT_RECORD_TIMEOUT))?
        .context("subscription failed")?;
    Ok((recording, last))
}
