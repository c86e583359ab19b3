//! Broadcast window — the shared surface every context can post to and
//! listen on.
//!
//! Every [`WindowListener`] receives every [`WindowEvent`] addressed to its
//! origin. Data is raw JSON so foreign scripts sharing the window can (and
//! do) post things that are not protocol envelopes at all.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::port::MessagePort;

/// Buffered events per listener before it starts lagging.
const WINDOW_CAPACITY: usize = 256;

/// Wildcard target origin: deliver to every listener.
pub const ANY_ORIGIN: &str = "*";

/// Take-once slot carrying a transferred port.
///
/// The event is cloned for every listener but the port is not: the first
/// listener to take it owns it. When every clone of the event is gone and
/// nobody took the port, the port is dropped and its peer sees it closed.
///
/// A listener that never drains the window keeps its clone of the event, and
/// with it the port, alive. Posters that must learn about an untaken port
/// keep the slot from [`Window::post_transfer`] and take the port back
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct TransferSlot(Arc<Mutex<Option<MessagePort>>>);

impl TransferSlot {
    fn new(port: Option<MessagePort>) -> Self {
        Self(Arc::new(Mutex::new(port)))
    }

    /// Take the port out, leaving the slot empty for everyone else.
    pub fn take(&self) -> Option<MessagePort> {
        self.0.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_none()
    }
}

/// A message posted on the window.
#[derive(Debug, Clone)]
pub struct WindowEvent {
    pub data: Value,
    /// Origin of the context that posted the event.
    pub origin: String,
    pub target_origin: String,
    pub ports: TransferSlot,
}

impl WindowEvent {
    fn is_addressed_to(&self, origin: &str) -> bool {
        self.target_origin == ANY_ORIGIN || self.target_origin == origin
    }
}

/// Handle onto a shared broadcast window, seen from one origin.
#[derive(Debug, Clone)]
pub struct Window {
    origin: String,
    tx: broadcast::Sender<WindowEvent>,
}

impl Window {
    pub fn new(origin: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(WINDOW_CAPACITY);
        Self {
            origin: origin.into(),
            tx,
        }
    }

    /// Another context sharing this window under a different origin.
    pub fn with_origin(&self, origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            tx: self.tx.clone(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Broadcast `data`, optionally handing `transfer` over to whichever
    /// listener takes it. Returns the number of listeners reached.
    pub fn post_message(
        &self,
        data: Value,
        target_origin: &str,
        transfer: Option<MessagePort>,
    ) -> usize {
        let event = WindowEvent {
            data,
            origin: self.origin.clone(),
            target_origin: target_origin.to_string(),
            ports: TransferSlot::new(transfer),
        };
        // No listeners is not an error: the event simply goes unheard.
        self.tx.send(event).unwrap_or(0)
    }

    /// Broadcast `data` together with `port`, returning the slot the port
    /// travels in so the poster can reclaim it if nobody takes it.
    pub fn post_transfer(&self, data: Value, target_origin: &str, port: MessagePort) -> TransferSlot {
        let ports = TransferSlot::new(Some(port));
        let event = WindowEvent {
            data,
            origin: self.origin.clone(),
            target_origin: target_origin.to_string(),
            ports: ports.clone(),
        };
        let _ = self.tx.send(event);
        ports
    }

    /// Start listening. Events posted before this call are not seen.
    pub fn subscribe(&self) -> WindowListener {
        WindowListener {
            origin: self.origin.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live listeners on the window.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A subscription to the window. Dropping it removes the listener.
#[derive(Debug)]
pub struct WindowListener {
    origin: String,
    rx: broadcast::Receiver<WindowEvent>,
}

impl WindowListener {
    /// Next event addressed to this listener's origin, or `None` once the
    /// window itself is gone.
    pub async fn recv(&mut self) -> Option<WindowEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.is_addressed_to(&self.origin) => return Some(event),
                Ok(event) => {
                    trace!(
                        "Skipping window event for {} (we are {})",
                        event.target_origin, self.origin
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Window listener lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MessageChannel;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_listener_sees_every_event() {
        let window = Window::new("https://example.com");
        let mut a = window.subscribe();
        let mut b = window.subscribe();
        assert_eq!(window.listener_count(), 2);

        assert_eq!(window.post_message(json!("hi"), ANY_ORIGIN, None), 2);
        assert_eq!(a.recv().await.unwrap().data, json!("hi"));
        let event = b.recv().await.unwrap();
        assert_eq!(event.data, json!("hi"));
        assert_eq!(event.origin, "https://example.com");
    }

    #[tokio::test]
    async fn test_post_without_listeners_reaches_nobody() {
        let window = Window::new("https://example.com");
        assert_eq!(window.post_message(json!(1), ANY_ORIGIN, None), 0);
    }

    #[tokio::test]
    async fn test_target_origin_filters_listeners() {
        let page = Window::new("https://page.test");
        let frame = page.with_origin("https://frame.test");
        let mut page_rx = page.subscribe();
        let mut frame_rx = frame.subscribe();

        frame.post_message(json!("for page"), "https://page.test", None);
        frame.post_message(json!("for all"), ANY_ORIGIN, None);

        assert_eq!(page_rx.recv().await.unwrap().data, json!("for page"));
        assert_eq!(page_rx.recv().await.unwrap().data, json!("for all"));
        assert_eq!(frame_rx.recv().await.unwrap().data, json!("for all"));
    }

    #[tokio::test]
    async fn test_transferred_port_is_taken_once() {
        let window = Window::new("https://example.com");
        let mut a = window.subscribe();
        let mut b = window.subscribe();

        let MessageChannel { port1, port2 } = MessageChannel::new();
        window.post_message(json!("transfer"), ANY_ORIGIN, Some(port2));

        let first = a.recv().await.unwrap();
        let second = b.recv().await.unwrap();
        let taken = first.ports.take().expect("first taker gets the port");
        assert!(second.ports.take().is_none());
        assert!(second.ports.is_empty());

        port1.post_message(json!("over the channel")).unwrap();
        let mut taken = taken;
        assert_eq!(taken.recv().await, Some(json!("over the channel")));
    }

    #[tokio::test]
    async fn test_untaken_port_closes_with_the_event() {
        let window = Window::new("https://example.com");
        let mut listener = window.subscribe();

        let MessageChannel { mut port1, port2 } = MessageChannel::new();
        window.post_message(json!("transfer"), ANY_ORIGIN, Some(port2));

        let event = listener.recv().await.unwrap();
        drop(event);
        drop(listener);

        let closed = tokio::time::timeout(Duration::from_secs(1), port1.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poster_reclaims_port_held_by_idle_listener() {
        let window = Window::new("https://example.com");
        let _idle = window.subscribe();

        let MessageChannel { mut port1, port2 } = MessageChannel::new();
        let slot = window.post_transfer(json!("transfer"), ANY_ORIGIN, port2);
        assert!(!slot.is_empty());

        // The idle listener still holds the event; taking the port back and
        // dropping it closes the channel regardless.
        drop(slot.take());
        let closed = tokio::time::timeout(Duration::from_secs(1), port1.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropping_listener_unsubscribes() {
        let window = Window::new("https://example.com");
        let listener = window.subscribe();
        assert_eq!(window.listener_count(), 1);
        drop(listener);
        assert_eq!(window.listener_count(), 0);
    }
}
