//! # Sluice
//!
//! A demand-driven streaming runtime where every unit of asynchronous work is
//! a leak-checked handle and every stateful stage owns its state behind a
//! mailbox.
//!
//! ## Core Concepts
//!
//! Sluice separates **who produces** from **how much is wanted**:
//! - [`Publisher`] = a cold description of a stream; nothing runs until subscribed
//! - [`Subscriber`] = receives one [`Publication`] at a time and answers with a [`Demand`]
//!
//! The key principle: **a value is only produced after the previous one was
//! answered.** Backpressure is the answer itself, not a side channel.
//!
//! ## Architecture
//!
//! ```text
//! Producer ──produce(demand)──► Supply
//!     │
//!     ▼ drive()
//! Publisher ─────────── subscribe ──────────────┐
//!     │                                         │
//!     ▼ Publication                             │
//! Subscriber.receive() ─► Demand ───────────────┘
//!     │
//!     └─► Cancellable<Demand> (the subscription's handle)
//!
//! StateTask<S, A>
//!     Channel<A> ──► Mailbox<A> ──► Reducer.reduce(&mut S, A) ──► Effect<A>
//!                         ▲                                         │
//!                         └──────────── Published feedback ─────────┘
//!
//! Distributor ──round──► repeater task per subscriber ──► Semaphore join
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One outstanding value** - A subscriber never sees a publication before answering the last
//! 2. **Exactly one completion** - Every subscription ends with one `Finished`, `Failure` or `Cancelled`
//! 3. **Handles are accounted for** - A [`Resumption`] or [`Cancellable`] dropped unresolved is a leak
//! 4. **State has one owner** - A [`StateTask`] is the only code that touches its state
//! 5. **Cancellation is prompt** - Cancelling a handle cancels everything it owns
//!
//! ## Example
//!
//! ```ignore
//! use sluice::{subscriber_fn, Demand, Publication, Publisher};
//!
//! let doubled = Publisher::from_iter(1..=3).map(|n| n * 2);
//! doubled
//!     .sink(subscriber_fn(|publication: Publication<i32>| async move {
//!         if let Publication::Value(n) = publication {
//!             println!("{n}");
//!         }
//!         Ok(Demand::max(1))
//!     }))
//!     .await?;
//! ```
//!
//! ## What This Is Not
//!
//! Sluice is **not**:
//! - A general operator library
//! - A scheduler or executor
//! - A persistence layer
//!
//! Sluice **is**:
//! > A small set of handles, primitives and combinators with backpressure and
//! > cancellation accounted for end to end.

// Core modules
mod cancellable;
mod config;
mod error;
mod leak;
mod resumption;

// Stream protocol
mod demand;
mod producer;
mod publication;
mod publisher;
mod subscriber;
mod transform;

// Synchronization primitives
mod channel;
mod queue;
mod semaphore;
mod stack;
mod state_task;

// Combinators
mod distributor;
mod multicast;
mod subject;
mod zip;

// Debug registry of outstanding handles
#[cfg(debug_assertions)]
pub mod audit;


// Re-export handle types
pub use cancellable::{CancelOnDrop, CancelSignal, Cancellable};
pub use leak::{HandleKind, LeakPolicy, Provenance};
pub use resumption::{with_resumption, Resumption, Suspension};

// Re-export configuration
pub use config::{Config, ConfigBuilder, LEAK_POLICY_ENV, MAILBOX_POLICY_ENV};

// Re-export error types
pub use error::{Result, SluiceError};

// Re-export protocol types
pub use demand::Demand;
pub use producer::{IterProducer, Producer};
pub use publication::{Completion, Publication, Supply};
pub use publisher::{resume_startup, Publish, Publisher};
pub use subscriber::{subscriber_fn, BoxSubscriber, FnSubscriber, Subscriber};

// Re-export primitives
pub use channel::{channel, BufferPolicy, Channel, EnqueueStatus, Mailbox};
pub use queue::Queue;
pub use semaphore::Semaphore;
pub use stack::Stack;
pub use state_task::{Effect, Reducer, StateTask};

// Re-export combinators
pub use distributor::Distributor;
pub use multicast::Multicaster;
pub use subject::Subject;
pub use zip::zip;

// Re-export commonly used external types
pub use async_trait::async_trait;
