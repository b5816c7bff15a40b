//! One-shot broadcast signals used for stop and completion notification.
//!
//! A [`Signal`] is a `flume` channel on which nothing is ever sent. Raising
//! it drops the only sender, after which every current and future receive
//! on the channel returns immediately with a disconnection. That makes the
//! signal observable by any number of waiters, and lets it take part in a
//! `flume::Selector` or a `tokio::select!` next to ordinary channel receives.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use flume::{Receiver, Sender};

/// A flag that can be raised exactly once and waited on by anyone.
pub struct Signal {
    /// Taken and dropped on raise
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Signal {
    /// Create a signal that has not been raised.
    pub fn new() -> Self {
        let (sender, receiver) = flume::bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Raise the signal.
    ///
    /// Returns `true` for the call that actually raised it. Raising an
    /// already raised signal does nothing and returns `false`.
    pub fn raise(&self) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        sender.is_some()
    }

    /// Whether the signal has been raised.
    pub fn is_raised(&self) -> bool {
        self.receiver.is_disconnected()
    }

    /// Block the current thread until the signal is raised.
    pub fn wait(&self) {
        // Nothing is ever sent, so this only returns on disconnect.
        let _ = self.receiver.recv();
    }

    /// Wait for the signal without blocking an executor thread.
    pub async fn wait_async(&self) {
        let _ = self.receiver.recv_async().await;
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("raised", &self.is_raised())
            .finish()
    }
}
