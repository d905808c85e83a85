//! Waiting for a dynamic set of running jobs to finish.
//!
//! A [`Drain`] holds the only receiver of a channel that never carries a
//! value. Each running job holds a [`DrainGuard`] with a sender. Once every
//! guard is dropped the receiver sees the channel close, which is the signal
//! that the dispatcher has drained.

use futures::never::Never;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Single-use waiter for all outstanding [`DrainGuard`]s
#[derive(Debug)]
pub(crate) struct Drain {
    recv: Receiver<Never>,
}

/// Held by every job while it runs.
///
/// Clone it to register another job with the same [`Drain`].
#[derive(Clone, Debug)]
pub(crate) struct DrainGuard {
    _send: Sender<Never>,
}

impl Drain {
    /// Creates a drain and its first guard.
    ///
    /// The drain cannot create guards itself; clone the returned one.
    pub(crate) fn new() -> (Self, DrainGuard) {
        let (send, recv) = channel(1);
        (Self { recv }, DrainGuard { _send: send })
    }

    /// Resolves once every guard has been dropped
    pub(crate) async fn wait(mut self) {
        let None = self.recv.recv().await;
    }
}
