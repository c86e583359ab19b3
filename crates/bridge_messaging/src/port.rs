//! Private two-endpoint channels and listener-removal tokens.
//!
//! A [`MessageChannel`] yields two linked [`MessagePort`]s. Whatever one port
//! posts, the other receives. Closing a port is dropping it: the peer's
//! `recv` then yields `None` and its posts fail with
//! [`MessagingError::PortClosed`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::MessagingError;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique port identifier, used to tell endpoints apart in logs and
/// in registry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl PortId {
    fn next() -> Self {
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// A pair of linked endpoints.
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    /// Two freshly linked ports.
    pub fn new() -> Self {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        Self {
            port1: MessagePort::from_parts(tx2, rx1),
            port2: MessagePort::from_parts(tx1, rx2),
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`MessageChannel`].
pub struct MessagePort {
    sender: PortSender,
    inbox: PortInbox,
}

impl MessagePort {
    fn from_parts(tx: mpsc::UnboundedSender<Value>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        let id = PortId::next();
        Self {
            sender: PortSender { id, tx },
            inbox: PortInbox { id, rx },
        }
    }

    pub fn id(&self) -> PortId {
        self.sender.id
    }

    /// Post a value to the linked port.
    pub fn post_message(&self, data: Value) -> Result<(), MessagingError> {
        self.sender.post_message(data)
    }

    /// Receive the next value posted by the linked port. `None` once the
    /// linked port is closed and everything it posted has been drained.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Split into a cloneable posting half and the receiving half.
    pub fn split(self) -> (PortSender, PortInbox) {
        (self.sender, self.inbox)
    }

    /// Close this endpoint.
    pub fn close(self) {}
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort").field("id", &self.id()).finish()
    }
}

/// Posting half of a [`MessagePort`].
#[derive(Debug, Clone)]
pub struct PortSender {
    id: PortId,
    tx: mpsc::UnboundedSender<Value>,
}

impl PortSender {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn post_message(&self, data: Value) -> Result<(), MessagingError> {
        self.tx
            .send(data)
            .map_err(|_| MessagingError::PortClosed(self.id.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`MessagePort`].
#[derive(Debug)]
pub struct PortInbox {
    id: PortId,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl PortInbox {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Listener-removal token.
///
/// Every listener task installed on the window or on a port is owned by one
/// of these. Removing or dropping the handle dismantles the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    abort: AbortHandle,
}

impl ListenerHandle {
    /// Spawn `task` as a listener and return its removal token.
    pub fn spawn<F>(task: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            abort: tokio::spawn(task).abort_handle(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// Stop the listener.
    pub fn remove(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
