//! In-process message passing between the dispatcher, units and the
//! incident source.
//!
//! An [`Address`] is where a payload is delivered; a [`Mailbox`] is the
//! receiving end. Replies are correlated by content: the requester embeds
//! its own reply address in the message it sends.

use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

use crate::error::TransportError;

/// Cloneable sending end.
pub struct Address<T> {
    sender: mpsc::Sender<T>,
}

/// Receiving end owned by exactly one activity.
pub struct Mailbox<T> {
    receiver: mpsc::Receiver<T>,
}

/// Create a connected address/mailbox pair.
pub fn channel<T>() -> (Address<T>, Mailbox<T>) {
    let (sender, receiver) = mpsc::channel();
    (Address { sender }, Mailbox { receiver })
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> fmt::Debug for Address<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Address")
    }
}

impl<T> Address<T> {
    /// Deliver `payload`; fails only if the mailbox is gone.
    pub fn send(&self, payload: T) -> Result<(), TransportError> {
        self.sender
            .send(payload)
            .map_err(|_| TransportError::Disconnected)
    }
}

impl<T> Mailbox<T> {
    /// Block until a payload arrives.
    pub fn recv(&self) -> Result<T, TransportError> {
        self.receiver.recv().map_err(|_| TransportError::Disconnected)
    }

    /// Wait up to `timeout`; `Ok(None)` means nothing arrived yet.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, TransportError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Result<Option<T>, TransportError> {
        match self.receiver.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

/// Send a request built around a fresh reply address and block for the
/// answer. `timeout` of `None` waits indefinitely.
pub fn request<M, R>(
    destination: &Address<M>,
    build: impl FnOnce(Address<R>) -> M,
    timeout: Option<Duration>,
) -> Result<R, TransportError> {
    let (reply_to, inbox) = channel();
    destination.send(build(reply_to))?;
    match timeout {
        None => inbox.recv(),
        Some(limit) => inbox
            .recv_timeout(limit)?
            .ok_or(TransportError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Ping {
        value: u32,
        reply_to: Address<u32>,
    }

    #[test]
    fn request_receives_reply_on_embedded_address() {
        let (address, mailbox) = channel::<Ping>();
        let server = thread::spawn(move || {
            let ping = mailbox.recv().expect("ping");
            ping.reply_to.send(ping.value + 1).expect("reply");
        });

        let reply = request(
            &address,
            |reply_to| Ping { value: 41, reply_to },
            Some(Duration::from_secs(1)),
        )
        .expect("reply");
        assert_eq!(reply, 42);
        server.join().expect("server panicked");
    }

    #[test]
    fn request_times_out_when_nobody_answers() {
        let (address, _mailbox) = channel::<Ping>();
        let err = request(
            &address,
            |reply_to| Ping { value: 1, reply_to },
            Some(Duration::from_millis(20)),
        )
        .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn send_to_dropped_mailbox_is_disconnected() {
        let (address, mailbox) = channel::<u8>();
        drop(mailbox);
        assert_eq!(address.send(1), Err(TransportError::Disconnected));
    }

    #[test]
    fn recv_timeout_distinguishes_empty_from_disconnected() {
        let (address, mailbox) = channel::<u8>();
        assert_eq!(mailbox.recv_timeout(Duration::from_millis(5)), Ok(None));
        drop(address);
        assert_eq!(
            mailbox.recv_timeout(Duration::from_millis(5)),
            Err(TransportError::Disconnected)
        );
    }
}
