//! Request/response carrier — traffic over an established private channel.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::MessagingError;
use crate::message::{LogicalMessage, PortFrame, ProtocolKind, ResponseFrame};
use crate::pending::PendingCalls;
use crate::port::{ListenerHandle, PortInbox, PortSender};
use crate::registry::ChannelRegistry;
use crate::router::ProcessMessage;
use crate::window::WindowState;

/// How a request ended on the sender side.
#[derive(Debug)]
pub(crate) enum Delivery {
    Response(serde_json::Value),
    /// The messenger was torn down before the response arrived.
    Abandoned,
}

/// Post `message` on the negotiated channel and wait for its response. The
/// channel is closed once the response is in. A teardown after `epoch`
/// turns any failure along the way into [`Delivery::Abandoned`].
pub(crate) async fn request(
    state: &WindowState,
    message: &LogicalMessage,
    epoch: u64,
) -> Result<Delivery, MessagingError> {
    let kind = message.kind.as_str();
    let response_rx = state.pending.lock().await_response(kind);
    let Some(response_rx) = response_rx else {
        return Ok(Delivery::Abandoned);
    };

    if let Err(e) = post_request(state, message) {
        if state.torn_down_since(epoch) {
            return Ok(Delivery::Abandoned);
        }
        return Err(e);
    }

    match response_rx.await {
        Ok(Err(_)) if state.torn_down_since(epoch) => Ok(Delivery::Abandoned),
        Ok(result) => {
            state.cleanup(kind);
            result.map(Delivery::Response)
        }
        Err(_) => Ok(Delivery::Abandoned),
    }
}

fn post_request(state: &WindowState, message: &LogicalMessage) -> Result<(), MessagingError> {
    let sender = state.registry.lock().sender_endpoint(&message.kind)?;
    let request = state
        .stamp
        .envelope(ProtocolKind::Request, message)
        .to_value()?;
    sender.post_message(request)
}

/// Listener on a sender channel's retained endpoint. Routes
/// transfer-port-complete and the response into the pending-call table.
pub(crate) fn listen_sender_port(
    kind: String,
    namespace: String,
    mut inbox: PortInbox,
    pending: Arc<Mutex<PendingCalls>>,
) -> ListenerHandle {
    ListenerHandle::spawn(async move {
        while let Some(data) = inbox.recv().await {
            match PortFrame::decode(&data) {
                Some(PortFrame::TransferPortComplete(envelope)) if envelope.namespace == namespace => {
                    pending.lock().complete_transfer(&kind);
                }
                Some(PortFrame::Response(response)) => {
                    debug!("[messaging/window] response received for {kind}");
                    pending.lock().resolve_response(&kind, Ok(response));
                }
                _ => debug!("Ignoring unexpected frame on {} for {kind}", inbox.id()),
            }
        }
        pending.lock().peer_closed(&kind);
    })
}

/// Listener on an accepted responder endpoint: answer the one request of
/// this cycle through the dispatch layer, then free the kind.
pub(crate) fn serve_port(
    kind: String,
    namespace: String,
    mut inbox: PortInbox,
    sender: PortSender,
    process: ProcessMessage,
    registry: Weak<Mutex<ChannelRegistry>>,
) -> ListenerHandle {
    ListenerHandle::spawn(async move {
        let port = inbox.id();
        while let Some(data) = inbox.recv().await {
            let envelope = match PortFrame::decode(&data) {
                Some(PortFrame::Request(envelope))
                    if envelope.namespace == namespace && envelope.message.kind == kind =>
                {
                    envelope
                }
                _ => {
                    debug!("Ignoring unexpected frame on {port} for {kind}");
                    continue;
                }
            };

            let message_id = envelope.message.id;
            let response = process(envelope.message).await;
            let posted = ResponseFrame::new(response)
                .to_value()
                .map_err(MessagingError::from)
                .and_then(|frame| sender.post_message(frame));
            match posted {
                Ok(()) => debug!(
                    "[messaging/window] responded. {{id={message_id} type={kind}}}"
                ),
                Err(e) => warn!("[messaging/window] could not respond to {kind}: {e}"),
            }
            break;
        }

        if let Some(registry) = registry.upgrade() {
            registry.lock().release_responder_if(&kind, port);
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InstanceId;
    use crate::message::{Envelope, EnvelopeStamp};
    use crate::pending::{CallStage, TransferOutcome};
    use crate::port::MessageChannel;
    use crate::registry::ResponderEndpoint;
    use crate::router::{MessageRouter, handler_fn};
    use serde_json::{Value, json};
    use std::time::Duration;

    const NS: &str = "carrier-test";

    fn stamp() -> EnvelopeStamp {
        EnvelopeStamp {
            namespace: NS.to_string(),
            instance_id: InstanceId::from_string("caller"),
            sender_origin: "https://example.com".to_string(),
        }
    }

    fn request_frame(kind: &str) -> Value {
        let message = LogicalMessage::new(5, kind, json!({"n": 2}));
        stamp().envelope(ProtocolKind::Request, &message).to_value().unwrap()
    }

    fn processor() -> ProcessMessage {
        let mut router = MessageRouter::new();
        router
            .register(
                "double",
                handler_fn(|msg| async move {
                    let n = msg.data["n"].as_i64().unwrap_or_default();
                    Ok(json!(n * 2))
                }),
            )
            .unwrap();
        MessageRouter::processor(Arc::new(parking_lot::RwLock::new(router)))
    }

    async fn recv(port: &mut crate::port::MessagePort) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(1), port.recv())
            .await
            .expect("port recv timed out")
    }

    #[tokio::test]
    async fn test_serve_port_answers_once_and_releases() {
        let registry = Arc::new(Mutex::new(ChannelRegistry::new()));
        let channel = MessageChannel::new();
        let mut remote = channel.port2;
        let (sender, inbox) = channel.port1.split();
        let serve = serve_port(
            "double".into(),
            NS.into(),
            inbox,
            sender.clone(),
            processor(),
            Arc::downgrade(&registry),
        );
        registry.lock().register_responder_endpoint(
            "double",
            ResponderEndpoint::new(sender, InstanceId::from_string("caller"), serve),
        );

        remote.post_message(request_frame("double")).unwrap();
        let response = recv(&mut remote).await.unwrap();
        assert_eq!(PortFrame::decode(&response), Some(PortFrame::Response(json!({"res": 4}))));

        // Endpoint released and closed after the single response.
        assert_eq!(recv(&mut remote).await, None);
        assert!(!registry.lock().has_responder_endpoint("double"));
    }

    #[tokio::test]
    async fn test_serve_port_ignores_foreign_frames() {
        let registry = Arc::new(Mutex::new(ChannelRegistry::new()));
        let channel = MessageChannel::new();
        let mut remote = channel.port2;
        let (sender, inbox) = channel.port1.split();
        let _serve = serve_port(
            "double".into(),
            NS.into(),
            inbox,
            sender,
            processor(),
            Arc::downgrade(&registry),
        );

        // Wrong kind, then garbage, then the real request.
        remote.post_message(request_frame("other")).unwrap();
        remote.post_message(json!({"type": "nonsense"})).unwrap();
        remote.post_message(request_frame("double")).unwrap();

        let response = recv(&mut remote).await.unwrap();
        assert_eq!(PortFrame::decode(&response), Some(PortFrame::Response(json!({"res": 4}))));
    }

    #[tokio::test]
    async fn test_unhandled_kind_answers_null() {
        let registry = Arc::new(Mutex::new(ChannelRegistry::new()));
        let channel = MessageChannel::new();
        let mut remote = channel.port2;
        let (sender, inbox) = channel.port1.split();
        let _serve = serve_port(
            "missing".into(),
            NS.into(),
            inbox,
            sender,
            processor(),
            Arc::downgrade(&registry),
        );

        remote.post_message(request_frame("missing")).unwrap();
        let response = recv(&mut remote).await.unwrap();
        assert_eq!(PortFrame::decode(&response), Some(PortFrame::Response(Value::Null)));
    }

    #[tokio::test]
    async fn test_sender_listener_routes_frames() {
        let pending = Arc::new(Mutex::new(PendingCalls::new()));
        let transfer_rx = pending.lock().begin("double", 5);
        pending.lock().mark_transferring("double");

        let channel = MessageChannel::new();
        let remote = channel.port2;
        let (_sender, inbox) = channel.port1.split();
        let _listener = listen_sender_port("double".into(), NS.into(), inbox, Arc::clone(&pending));

        let message = LogicalMessage::new(5, "double", Value::Null);
        let complete: Envelope = EnvelopeStamp {
            instance_id: InstanceId::from_string("responder"),
            ..stamp()
        }
        .envelope(ProtocolKind::TransferPortComplete, &message);
        remote.post_message(complete.to_value().unwrap()).unwrap();
        assert_eq!(transfer_rx.await.unwrap(), TransferOutcome::Complete);

        let response_rx = pending.lock().await_response("double").unwrap();
        remote
            .post_message(ResponseFrame::new(Some(json!({"res": 4}))).to_value().unwrap())
            .unwrap();
        assert_eq!(response_rx.await.unwrap().unwrap(), json!({"res": 4}));
        assert_eq!(pending.lock().stage("double"), Some(CallStage::AwaitingResponse));
    }

    #[tokio::test]
    async fn test_sender_listener_reports_rejected_transfer() {
        let pending = Arc::new(Mutex::new(PendingCalls::new()));
        let transfer_rx = pending.lock().begin("double", 5);
        pending.lock().mark_transferring("double");

        let channel = MessageChannel::new();
        let (_sender, inbox) = channel.port1.split();
        let _listener = listen_sender_port("double".into(), NS.into(), inbox, Arc::clone(&pending));

        // The transferred half is dropped without anyone taking it.
        drop(channel.port2);
        assert_eq!(transfer_rx.await.unwrap(), TransferOutcome::Rejected);
    }
}
