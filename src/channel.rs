//! Thin wrapper around the channel implementation used by every edge of the
//! stage network.
//!
//! All the edges between stages are bounded channels, the producer blocks
//! when the buffer is full providing backpressure. The only exception is the
//! iteration feedback edge, which is unbounded to avoid deadlocks on the
//! cycle.

pub(crate) use flume::{Receiver, Selector, Sender, TrySendError};

/// Create a new bounded channel with the given capacity.
pub(crate) fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    flume::bounded(capacity)
}

/// Create a new unbounded channel.
pub(crate) fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    flume::unbounded()
}
