//! Multi-producer mailbox feeding exactly one consumer.
//!
//! [`channel`] returns a cloneable [`Channel`] for senders and the unique
//! [`Mailbox`] for the consumer. Actions are stored in the lock-free
//! [`Queue`]; a [`BufferPolicy`] bounds how many may wait.
//!
//! # Closing
//!
//! - [`Channel::finish`] closes for new actions; queued ones are still received
//! - dropping the last [`Channel`] does the same
//! - [`Mailbox::close`] closes and guarantees nothing is enqueued afterwards,
//!   so the consumer can drain what is left with [`Mailbox::try_recv`]
//!
//! Offers on a closed channel return the action as [`EnqueueStatus::Terminated`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use tokio::sync::Notify;

use crate::error::{Result, SluiceError};
use crate::queue::Queue;

/// How many actions may wait in a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPolicy {
    #[default]
    Unbounded,
    /// Keep the oldest `n`; a new action beyond that is dropped.
    BufferingOldest(usize),
    /// Keep the newest `n`; the oldest waiting action is evicted.
    BufferingNewest(usize),
}

/// Outcome of [`Channel::offer`].
#[derive(Debug)]
pub enum EnqueueStatus<A> {
    Enqueued,
    /// The buffer was full. Carries the action that did not make it: the
    /// offered one for `BufferingOldest`, the evicted one for `BufferingNewest`.
    Dropped(A),
    /// The mailbox is closed; the offered action is handed back.
    Terminated(A),
}

impl<A> EnqueueStatus<A> {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueStatus::Enqueued)
    }
}

struct Shared<A> {
    queue: Queue<A>,
    len: AtomicUsize,
    closed: AtomicBool,
    /// Offers between their closed-check and their enqueue.
    active: AtomicUsize,
    senders: AtomicUsize,
    notify: Notify,
    policy: BufferPolicy,
}

impl<A> Shared<A> {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Create a mailbox and its first sender.
pub fn channel<A: Send>(policy: BufferPolicy) -> (Channel<A>, Mailbox<A>) {
    let shared = Arc::new(Shared {
        queue: Queue::new(),
        len: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        active: AtomicUsize::new(0),
        senders: AtomicUsize::new(1),
        notify: Notify::new(),
        policy,
    });
    (
        Channel {
            shared: shared.clone(),
            counted: true,
        },
        Mailbox { shared },
    )
}

/// Sending side of a mailbox.
pub struct Channel<A> {
    shared: Arc<Shared<A>>,
    /// Counted senders keep the mailbox open.
    counted: bool,
}

impl<A> Clone for Channel<A> {
    fn clone(&self) -> Self {
        if self.counted {
            self.shared.senders.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            shared: self.shared.clone(),
            counted: self.counted,
        }
    }
}

impl<A> Drop for Channel<A> {
    fn drop(&mut self) {
        if self.counted && self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.close();
        }
    }
}

impl<A> std::fmt::Debug for Channel<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("policy", &self.shared.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<A: Send> Channel<A> {
    /// Try to enqueue `action` without waiting.
    pub fn offer(&self, action: A) -> EnqueueStatus<A> {
        let shared = &*self.shared;
        shared.active.fetch_add(1, Ordering::SeqCst);
        let status = if shared.closed.load(Ordering::SeqCst) {
            EnqueueStatus::Terminated(action)
        } else {
            self.enqueue(action)
        };
        shared.active.fetch_sub(1, Ordering::SeqCst);
        if status.is_enqueued() || shared.closed.load(Ordering::SeqCst) {
            shared.notify.notify_one();
        }
        if let EnqueueStatus::Dropped(_) = status {
            tracing::warn!(policy = ?shared.policy, "mailbox full, action dropped");
        }
        status
    }

    fn enqueue(&self, action: A) -> EnqueueStatus<A> {
        let shared = &*self.shared;
        match shared.policy {
            BufferPolicy::Unbounded => {
                shared.len.fetch_add(1, Ordering::SeqCst);
                shared.queue.enqueue(action);
                EnqueueStatus::Enqueued
            }
            BufferPolicy::BufferingOldest(limit) => {
                let reserved = shared
                    .len
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |len| {
                        (len < limit).then_some(len + 1)
                    });
                match reserved {
                    Ok(_) => {
                        shared.queue.enqueue(action);
                        EnqueueStatus::Enqueued
                    }
                    Err(_) => EnqueueStatus::Dropped(action),
                }
            }
            BufferPolicy::BufferingNewest(limit) => {
                let len = shared.len.fetch_add(1, Ordering::SeqCst) + 1;
                shared.queue.enqueue(action);
                if len <= limit {
                    return EnqueueStatus::Enqueued;
                }
                match shared.queue.dequeue() {
                    Some(evicted) => {
                        shared.len.fetch_sub(1, Ordering::SeqCst);
                        // The new action still went in; wake the consumer.
                        shared.notify.notify_one();
                        EnqueueStatus::Dropped(evicted)
                    }
                    None => EnqueueStatus::Enqueued,
                }
            }
        }
    }

    /// Enqueue `action`, reporting a full or closed mailbox as an error.
    pub fn send(&self, action: A) -> Result<()> {
        match self.offer(action) {
            EnqueueStatus::Enqueued => Ok(()),
            EnqueueStatus::Dropped(_) => Err(SluiceError::EnqueueError),
            EnqueueStatus::Terminated(_) => Err(SluiceError::Completed),
        }
    }
}

impl<A> Channel<A> {
    /// Close the mailbox for new actions. Already queued actions are kept.
    pub fn finish(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> BufferPolicy {
        self.shared.policy
    }

    /// A sender that does not keep the mailbox open.
    pub(crate) fn uncounted(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            counted: false,
        }
    }
}

/// Receiving side of a mailbox. There is exactly one per channel.
pub struct Mailbox<A> {
    shared: Arc<Shared<A>>,
}

impl<A> std::fmt::Debug for Mailbox<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<A> Mailbox<A> {
    /// Wait for the next action. `None` once closed and empty.
    pub async fn recv(&mut self) -> Option<A> {
        loop {
            if let Some(action) = self.try_recv() {
                return Some(action);
            }
            let shared = self.shared.clone();
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(action) = self.try_recv() {
                return Some(action);
            }
            if self.is_closed() && self.shared.active.load(Ordering::SeqCst) == 0 {
                return self.try_recv();
            }
            notified.await;
        }
    }

    /// Take the next action if one is queued.
    pub fn try_recv(&mut self) -> Option<A> {
        let action = self.shared.queue.dequeue()?;
        self.shared.len.fetch_sub(1, Ordering::SeqCst);
        Some(action)
    }

    /// Close the mailbox. Once this returns no further action can arrive.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.shared.active.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }

    /// Close and take everything still queued.
    pub fn drain(&mut self) -> Vec<A> {
        self.close();
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl<A> Drop for Mailbox<A> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unbounded_delivers_in_order() {
        let (channel, mut mailbox) = channel(BufferPolicy::Unbounded);
        for i in 0..5 {
            channel.send(i).unwrap();
        }
        channel.finish();
        let mut received = Vec::new();
        while let Some(action) = mailbox.recv().await {
            received.push(action);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_buffering_oldest_drops_newest() {
        let (channel, mut mailbox) = channel(BufferPolicy::BufferingOldest(1));
        assert!(channel.offer("first").is_enqueued());
        assert!(matches!(channel.offer("second"), EnqueueStatus::Dropped("second")));
        assert!(matches!(channel.send("third"), Err(SluiceError::EnqueueError)));
        assert_eq!(mailbox.try_recv(), Some("first"));
        assert_eq!(mailbox.try_recv(), None);
        // Room again after the consumer caught up.
        assert!(channel.offer("fourth").is_enqueued());
    }

    #[tokio::test]
    async fn test_buffering_newest_evicts_oldest() {
        let (channel, mut mailbox) = channel(BufferPolicy::BufferingNewest(2));
        assert!(channel.offer(1).is_enqueued());
        assert!(channel.offer(2).is_enqueued());
        assert!(matches!(channel.offer(3), EnqueueStatus::Dropped(1)));
        assert_eq!(mailbox.drain(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_closed_mailbox_returns_action() {
        let (channel, mut mailbox) = channel::<u8>(BufferPolicy::Unbounded);
        mailbox.close();
        assert!(matches!(channel.offer(9), EnqueueStatus::Terminated(9)));
        assert!(matches!(channel.send(9), Err(SluiceError::Completed)));
    }

    #[tokio::test]
    async fn test_last_sender_drop_closes() {
        let (channel, mut mailbox) = channel(BufferPolicy::Unbounded);
        let second = channel.clone();
        drop(channel);
        second.send(1).unwrap();
        drop(second);
        assert_eq!(mailbox.recv().await, Some(1));
        assert_eq!(mailbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_uncounted_sender_does_not_hold_open() {
        let (channel, mut mailbox) = channel::<u8>(BufferPolicy::Unbounded);
        let internal = channel.uncounted();
        drop(channel);
        assert_eq!(mailbox.recv().await, None);
        assert!(matches!(internal.offer(1), EnqueueStatus::Terminated(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recv_wakes_on_send_from_other_task() {
        let (channel, mut mailbox) = channel(BufferPolicy::Unbounded);
        let sender = tokio::spawn(async move {
            for i in 0..100u32 {
                channel.send(i).unwrap();
                if i % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });
        let mut total = 0;
        while let Some(i) = mailbox.recv().await {
            total += i;
        }
        sender.await.unwrap();
        assert_eq!(total, (0..100).sum());
    }

    #[tokio::test]
    async fn test_parked_recv_wakes_on_later_offer() {
        let (channel, mut mailbox) = channel(BufferPolicy::Unbounded);
        let receiver = tokio::spawn(async move {
            let first = mailbox.recv().await;
            let second = mailbox.recv().await;
            (first, second)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.offer("late").is_enqueued());
        drop(channel);
        assert_eq!(receiver.await.unwrap(), (Some("late"), None));
    }
}
