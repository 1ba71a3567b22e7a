//! Lossy multi-subscriber broadcast for unsolicited events.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_broadcast::InactiveReceiver;
use futures_core::Stream;

/// A broadcast channel that keeps only the most recent unconsumed item.
///
/// Publishing never blocks: when the single-item buffer is full the oldest
/// item is evicted, so a slow subscriber observes the latest value rather
/// than a backlog. Subscribers attached after an item was published do not
/// see it.
pub(crate) struct Bus<T> {
    sender: async_broadcast::Sender<T>,
    // Keeps the channel open while no subscription exists.
    _keep: InactiveReceiver<T>,
}

impl<T: Clone> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity);
        sender.set_overflow(true);
        Bus {
            sender,
            _keep: receiver.deactivate(),
        }
    }

    /// Delivers `value` to every current subscriber. Dropped if nobody is
    /// listening.
    pub fn publish(&self, value: T) {
        let _ = self.sender.try_broadcast(value);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            receiver: self.sender.new_receiver(),
        }
    }
}

/// One subscriber's view of a broadcast sequence.
///
/// An infinite [`Stream`]: it never ends while the publishing side is alive,
/// and yields only items published after the subscription was created. See
/// [`GattClient::notifications`][crate::GattClient::notifications] for the
/// delivery guarantees.
pub struct Subscription<T> {
    receiver: async_broadcast::Receiver<T>,
}

impl<T: Clone> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.receiver.size_hint()
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
