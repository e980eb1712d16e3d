//! Single-use reply conduit.
//!
//! Every envelope carries a fresh [`Reply`] created by its submitter. The
//! worker that executes the envelope writes exactly one value into it and
//! the submitter reads it from the matching [`ReplyReceiver`]. Sending
//! consumes the conduit, so a second write cannot be expressed.

use tokio::sync::oneshot;

/// Receiving half of a reply conduit. Owned by the submitter only.
pub type ReplyReceiver<T> = oneshot::Receiver<T>;

/// Writing half of a reply conduit. Owned by the envelope, then the worker.
#[derive(Debug)]
pub struct Reply<T> {
    sender: oneshot::Sender<T>,
}

/// Create a fresh reply conduit with room for exactly one value.
#[must_use]
pub fn reply_channel<T>() -> (Reply<T>, ReplyReceiver<T>) {
    let (sender, receiver) = oneshot::channel();
    (Reply { sender }, receiver)
}

impl<T> Reply<T> {
    /// Deliver the result to the submitter.
    ///
    /// Returns `false` when the submitter has stopped listening (timed out
    /// or dropped its receiver); the value is discarded in that case.
    pub fn send(self, value: T) -> bool {
        self.sender.send(value).is_ok()
    }

    /// Whether the submitter has already given up on this reply.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}
