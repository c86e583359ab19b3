//! Channel registry — the per-kind private channel slots of one messenger.
//!
//! Sender side: at most one [`SenderChannel`] per message kind, holding the
//! retained endpoint and (until it is handed over) the responder endpoint.
//! Receiver side: at most one [`ResponderEndpoint`] per message kind,
//! received through a completed transfer.

use std::collections::HashMap;

use tracing::debug;

use crate::error::MessagingError;
use crate::identity::InstanceId;
use crate::port::{ListenerHandle, MessageChannel, MessagePort, PortId, PortInbox, PortSender};

/// The half of a sender channel destined for the remote side.
#[derive(Debug)]
pub enum ResponderHalf {
    /// Still owned locally; not yet announced.
    Retained(MessagePort),
    /// Moved onto the window. Never touched again from this side.
    Transferred,
}

/// A live sender channel for one message kind.
#[derive(Debug)]
pub struct SenderChannel {
    sender: PortSender,
    responder: ResponderHalf,
    /// Listener reading the retained endpoint.
    _listener: ListenerHandle,
}

impl SenderChannel {
    /// The retained endpoint.
    pub fn sender(&self) -> &PortSender {
        &self.sender
    }

    /// Whether the responder half has been handed over.
    pub fn is_transferred(&self) -> bool {
        matches!(self.responder, ResponderHalf::Transferred)
    }
}

/// An endpoint received from a remote announcer.
#[derive(Debug)]
pub struct ResponderEndpoint {
    sender: PortSender,
    remote: InstanceId,
    _listener: ListenerHandle,
}

impl ResponderEndpoint {
    /// Wrap an accepted endpoint with the listener serving it.
    pub fn new(sender: PortSender, remote: InstanceId, listener: ListenerHandle) -> Self {
        Self {
            sender,
            remote,
            _listener: listener,
        }
    }

    /// Identity of the accepted endpoint.
    pub fn port_id(&self) -> PortId {
        self.sender.id()
    }

    /// Instance that transferred the endpoint.
    pub fn remote(&self) -> &InstanceId {
        &self.remote
    }
}

/// Owned table of channel slots keyed by message kind.
///
/// Dropping an entry closes its endpoints and removes its listener.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    sender_channels: HashMap<String, SenderChannel>,
    responder_ports: HashMap<String, ResponderEndpoint>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the retained endpoint for `kind`, creating the channel if none
    /// exists. `attach` is called once, on creation, to install the listener
    /// on the retained endpoint.
    pub fn ensure_sender_channel<F>(&mut self, kind: &str, attach: F) -> PortSender
    where
        F: FnOnce(PortInbox) -> ListenerHandle,
    {
        if let Some(channel) = self.sender_channels.get(kind) {
            return channel.sender.clone();
        }

        let MessageChannel { port1, port2 } = MessageChannel::new();
        let (sender, inbox) = port1.split();
        debug!("Opened sender channel for {kind} ({} <-> {})", sender.id(), port2.id());

        let channel = SenderChannel {
            sender: sender.clone(),
            responder: ResponderHalf::Retained(port2),
            _listener: attach(inbox),
        };
        self.sender_channels.insert(kind.to_string(), channel);
        sender
    }

    /// The sender channel for `kind`, if open.
    pub fn sender_channel(&self, kind: &str) -> Option<&SenderChannel> {
        self.sender_channels.get(kind)
    }

    /// The retained endpoint for `kind`; the channel must already exist.
    pub fn sender_endpoint(&self, kind: &str) -> Result<PortSender, MessagingError> {
        self.sender_channels
            .get(kind)
            .map(|channel| channel.sender.clone())
            .ok_or_else(|| MessagingError::MissingSenderChannel(kind.to_string()))
    }

    /// Move the responder half out for transfer. The slot is marked
    /// transferred so the half can never be handed out twice.
    pub fn take_responder_half(&mut self, kind: &str) -> Result<MessagePort, MessagingError> {
        let channel = self
            .sender_channels
            .get_mut(kind)
            .ok_or_else(|| MessagingError::MissingSenderChannel(kind.to_string()))?;

        match std::mem::replace(&mut channel.responder, ResponderHalf::Transferred) {
            ResponderHalf::Retained(port) => Ok(port),
            ResponderHalf::Transferred => Err(MessagingError::MissingResponderPort(kind.to_string())),
        }
    }

    /// Register an endpoint received for `kind`. A no-op returning `false`
    /// (and closing `endpoint`) if one is already registered.
    pub fn register_responder_endpoint(&mut self, kind: &str, endpoint: ResponderEndpoint) -> bool {
        if self.responder_ports.contains_key(kind) {
            debug!(
                "Ignoring responder endpoint {} for {kind}: one is already registered",
                endpoint.port_id()
            );
            return false;
        }
        self.responder_ports.insert(kind.to_string(), endpoint);
        true
    }

    /// Whether an endpoint has been accepted for `kind`.
    pub fn has_responder_endpoint(&self, kind: &str) -> bool {
        self.responder_ports.contains_key(kind)
    }

    /// The registered responder endpoint for `kind`.
    pub fn responder_endpoint(&self, kind: &str) -> Result<PortSender, MessagingError> {
        self.responder_ports
            .get(kind)
            .map(|endpoint| endpoint.sender.clone())
            .ok_or_else(|| MessagingError::MissingResponderPort(kind.to_string()))
    }

    /// Close both endpoints of the sender channel for `kind` and forget it,
    /// freeing the kind for a future call. Safe when nothing is registered.
    pub fn release_channel(&mut self, kind: &str) {
        if self.sender_channels.remove(kind).is_some() {
            debug!("Closed sender channel for {kind}");
        }
    }

    /// Release the responder endpoint for `kind`, but only if it is still
    /// the endpoint identified by `port`.
    pub fn release_responder_if(&mut self, kind: &str, port: PortId) -> bool {
        match self.responder_ports.get(kind) {
            Some(endpoint) if endpoint.port_id() == port => {
                self.responder_ports.remove(kind);
                debug!("Released responder endpoint {port} for {kind}");
                true
            }
            _ => false,
        }
    }

    /// Close every endpoint, sender and responder side.
    pub fn release_all(&mut self) -> usize {
        let released = self.sender_channels.len() + self.responder_ports.len();
        self.sender_channels.clear();
        self.responder_ports.clear();
        released
    }

    /// Number of open sender channels.
    pub fn sender_count(&self) -> usize {
        self.sender_channels.len()
    }

    /// Number of accepted responder endpoints.
    pub fn responder_count(&self) -> usize {
        self.responder_ports.len()
    }

    /// Whether nothing at all is open.
    pub fn is_empty(&self) -> bool {
        self.sender_channels.is_empty() && self.responder_ports.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn idle_listener(inbox: PortInbox) -> ListenerHandle {
        ListenerHandle::spawn(async move {
            let _inbox = inbox;
            std::future::pending::<()>().await;
        })
    }

    fn responder(remote: &str) -> (ResponderEndpoint, MessagePort) {
        let MessageChannel { port1, port2 } = MessageChannel::new();
        let (sender, inbox) = port1.split();
        let endpoint =
            ResponderEndpoint::new(sender, InstanceId::from_string(remote), idle_listener(inbox));
        (endpoint, port2)
    }

    #[tokio::test]
    async fn test_ensure_sender_channel_is_idempotent() {
        let mut registry = ChannelRegistry::new();
        let mut attached = 0;

        let first = registry.ensure_sender_channel("ping", |inbox| {
            attached += 1;
            idle_listener(inbox)
        });
        let second = registry.ensure_sender_channel("ping", |inbox| {
            attached += 1;
            idle_listener(inbox)
        });

        assert_eq!(first.id(), second.id());
        assert_eq!(attached, 1);
        assert_eq!(registry.sender_count(), 1);
    }

    #[tokio::test]
    async fn test_responder_half_is_handed_out_once() {
        let mut registry = ChannelRegistry::new();
        let sender = registry.ensure_sender_channel("ping", idle_listener);

        let mut half = registry.take_responder_half("ping").unwrap();
        assert!(registry.sender_channel("ping").unwrap().is_transferred());
        assert!(matches!(
            registry.take_responder_half("ping"),
            Err(MessagingError::MissingResponderPort(_))
        ));

        sender.post_message(json!("hello")).unwrap();
        assert_eq!(half.recv().await, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_take_responder_half_without_channel() {
        let mut registry = ChannelRegistry::new();
        assert!(matches!(
            registry.take_responder_half("ping"),
            Err(MessagingError::MissingSenderChannel(_))
        ));
        assert!(registry.sender_endpoint("ping").is_err());
    }

    #[tokio::test]
    async fn test_second_responder_endpoint_is_refused() {
        let mut registry = ChannelRegistry::new();
        let (first, _first_peer) = responder("remote-a");
        let first_id = first.port_id();
        let (second, mut second_peer) = responder("remote-b");

        assert!(registry.register_responder_endpoint("ping", first));
        assert!(!registry.register_responder_endpoint("ping", second));
        assert_eq!(registry.responder_endpoint("ping").unwrap().id(), first_id);

        // The refused endpoint was closed.
        let closed = tokio::time::timeout(Duration::from_secs(1), second_peer.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_closes_both_endpoints() {
        let mut registry = ChannelRegistry::new();
        let retained = registry.ensure_sender_channel("ping", idle_listener);
        let mut half = registry.take_responder_half("ping").unwrap();
        drop(retained);

        registry.release_channel("ping");
        assert!(registry.sender_channel("ping").is_none());
        assert!(registry.sender_endpoint("ping").is_err());
        assert_eq!(half.recv().await, None);

        // Releasing again is harmless.
        registry.release_channel("ping");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_channel_keeps_inbound_endpoint() {
        let mut registry = ChannelRegistry::new();
        registry.ensure_sender_channel("ping", idle_listener);
        let (endpoint, _peer) = responder("remote");
        registry.register_responder_endpoint("ping", endpoint);

        registry.release_channel("ping");
        assert_eq!(registry.sender_count(), 0);
        assert!(registry.has_responder_endpoint("ping"));
    }

    #[tokio::test]
    async fn test_release_responder_checks_port_identity() {
        let mut registry = ChannelRegistry::new();
        let (endpoint, _peer) = responder("remote");
        let id = endpoint.port_id();
        registry.register_responder_endpoint("ping", endpoint);

        let (other, _other_peer) = responder("remote");
        assert!(!registry.release_responder_if("ping", other.port_id()));
        assert!(registry.has_responder_endpoint("ping"));

        assert!(registry.release_responder_if("ping", id));
        assert!(!registry.has_responder_endpoint("ping"));
    }

    #[tokio::test]
    async fn test_release_all() {
        let mut registry = ChannelRegistry::new();
        registry.ensure_sender_channel("a", idle_listener);
        registry.ensure_sender_channel("b", idle_listener);
        let (endpoint, _peer) = responder("remote");
        registry.register_responder_endpoint("c", endpoint);

        assert_eq!(registry.release_all(), 3);
        assert!(registry.is_empty());
    }
}
