//! Handshake negotiator — establishes a private channel per message kind.
//!
//! Sender side, per call: announce handshake-start on every retry tick until
//! a remote messenger echoes handshake-complete for the same kind, then move
//! the responder endpoint onto the window with transfer-port-start. The
//! retained endpoint's listener reports transfer-port-complete back through
//! the pending-call table.
//!
//! Receiver side, one root listener: answer handshakes, accept transferred
//! endpoints, and hand each accepted endpoint to the carrier.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::carrier;
use crate::error::MessagingError;
use crate::message::{Envelope, EnvelopeStamp, LogicalMessage, ProtocolKind};
use crate::pending::TransferOutcome;
use crate::port::{ListenerHandle, MessagePort};
use crate::registry::{ChannelRegistry, ResponderEndpoint};
use crate::router::ProcessMessage;
use crate::transport::{TransferSlot, Window, WindowEvent};
use crate::window::WindowState;

/// How negotiation for one call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Negotiated {
    /// The remote side holds the responder endpoint; the channel is usable.
    Ready,
    /// The messenger was torn down mid-negotiation.
    Abandoned,
}

// ---------------------------------------------------------------------------
// Sender side
// ---------------------------------------------------------------------------

/// Drive handshake and transfer for `message` until the private channel is
/// established. Retries indefinitely while nobody answers.
///
/// `epoch` is the teardown epoch the call started in; once the messenger has
/// been torn down since, every outcome is [`Negotiated::Abandoned`].
pub(crate) async fn negotiate(
    state: &Arc<WindowState>,
    message: &LogicalMessage,
    target_origin: &str,
    epoch: u64,
) -> Result<Negotiated, MessagingError> {
    let kind = message.kind.as_str();
    // Subscribed for the whole negotiation so no echo is missed; also keeps
    // draining events after the ack so an untaken endpoint gets dropped.
    let mut window_rx = state.window.subscribe();

    loop {
        let mut transfer_rx = {
            // Checked under the table lock: teardown either sees this entry
            // and clears it, or has already moved the epoch on.
            let mut pending = state.pending.lock();
            if state.torn_down_since(epoch) {
                return Ok(Negotiated::Abandoned);
            }
            pending.begin(kind, message.id)
        };
        state.ensure_sender_channel(kind);

        let mut ticker = tokio::time::interval(state.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut acknowledged = false;
        // The slot our responder endpoint travels in, until the retry tick
        // after the transfer.
        let mut in_flight: Option<TransferSlot> = None;

        let outcome = loop {
            tokio::select! {
                outcome = &mut transfer_rx => break outcome,

                _ = ticker.tick(), if !acknowledged || in_flight.is_some() => {
                    if let Some(slot) = in_flight.take() {
                        // Nobody took the endpoint within a retry interval.
                        // Dropping it closes the channel, which reports the
                        // transfer as rejected.
                        if slot.take().is_some() {
                            debug!(
                                "[messaging/window] no taker for port transfer. {{id={} type={kind}}}",
                                message.id
                            );
                        }
                        continue;
                    }
                    debug!(
                        "[messaging/window] try handshake. {{id={} type={kind}}}",
                        message.id
                    );
                    state.broadcast(ProtocolKind::HandshakeStart, message, target_origin)?;
                }

                event = window_rx.recv() => {
                    let Some(event) = event else {
                        return Ok(Negotiated::Abandoned);
                    };
                    if acknowledged || !is_handshake_ack(&state.stamp, &event, kind) {
                        continue;
                    }
                    debug!(
                        "[messaging/window] handshake complete. {{id={} type={kind}}}",
                        message.id
                    );
                    acknowledged = true;
                    match transfer_port(state, message, target_origin) {
                        Ok(slot) => {
                            in_flight = Some(slot);
                            ticker.reset();
                        }
                        Err(_) if state.torn_down_since(epoch) => return Ok(Negotiated::Abandoned),
                        Err(e) => return Err(e),
                    }
                }
            }
        };

        match outcome {
            Ok(TransferOutcome::Complete) => {
                debug!(
                    "[messaging/window] succeed port transfer. {{id={} type={kind}}}",
                    message.id
                );
                return Ok(Negotiated::Ready);
            }
            Ok(TransferOutcome::Rejected) => {
                debug!(
                    "[messaging/window] port transfer rejected, renegotiating. {{id={} type={kind}}}",
                    message.id
                );
                state.registry.lock().release_channel(kind);
            }
            // The pending entry was dropped by teardown.
            Err(_) => return Ok(Negotiated::Abandoned),
        }
    }
}

/// A handshake-complete echo for `kind` from some other messenger in our
/// namespace.
fn is_handshake_ack(stamp: &EnvelopeStamp, event: &WindowEvent, kind: &str) -> bool {
    Envelope::decode(&event.data).is_some_and(|envelope| {
        envelope.protocol_kind == ProtocolKind::HandshakeComplete
            && stamp.accepts(&envelope)
            && envelope.message.kind == kind
    })
}

/// Move the responder endpoint for `message.kind` onto the window. Returns
/// the slot it travels in.
fn transfer_port(
    state: &WindowState,
    message: &LogicalMessage,
    target_origin: &str,
) -> Result<TransferSlot, MessagingError> {
    debug!(
        "[messaging/window] try port transfer. {{id={} type={}}}",
        message.id, message.kind
    );
    let envelope = state
        .stamp
        .envelope(ProtocolKind::TransferPortStart, message)
        .to_value()?;
    let responder = state.registry.lock().take_responder_half(&message.kind)?;
    state.pending.lock().mark_transferring(&message.kind);
    Ok(state.window.post_transfer(envelope, target_origin, responder))
}

// ---------------------------------------------------------------------------
// Receiver side
// ---------------------------------------------------------------------------

/// What the root listener needs from the shared state.
struct Responder {
    stamp: EnvelopeStamp,
    window: Window,
    registry: Arc<parking_lot::Mutex<ChannelRegistry>>,
    process: ProcessMessage,
}

/// Install the receiver-side window listener.
pub(crate) fn spawn_root_listener(state: &WindowState, process: ProcessMessage) -> ListenerHandle {
    // Subscribe before spawning so nothing posted after this call is missed.
    let mut listener = state.window.subscribe();
    let responder = Responder {
        stamp: state.stamp.clone(),
        window: state.window.clone(),
        registry: Arc::clone(&state.registry),
        process,
    };

    ListenerHandle::spawn(async move {
        while let Some(event) = listener.recv().await {
            responder.handle_event(event);
        }
    })
}

impl Responder {
    fn handle_event(&self, event: WindowEvent) {
        let Some(envelope) = Envelope::decode(&event.data) else {
            return;
        };
        if !self.stamp.accepts(&envelope) {
            return;
        }
        // Busy with a live call of this kind: stay silent so the announcer
        // keeps retrying until we are free.
        if self.registry.lock().has_responder_endpoint(&envelope.message.kind) {
            return;
        }

        match envelope.protocol_kind {
            ProtocolKind::HandshakeStart => self.answer_handshake(&envelope, &event.origin),
            ProtocolKind::TransferPortStart => match event.ports.take() {
                Some(port) => self.accept_transfer(envelope, port),
                None => debug!(
                    "[messaging/window] transfer for {} carried no port (already taken)",
                    envelope.message.kind
                ),
            },
            _ => {}
        }
    }

    fn answer_handshake(&self, envelope: &Envelope, origin: &str) {
        debug!(
            "[messaging/window] receive handshake message. {{id={} type={}}}",
            envelope.message.id, envelope.message.kind
        );
        match self
            .stamp
            .envelope(ProtocolKind::HandshakeComplete, &envelope.message)
            .to_value()
        {
            Ok(reply) => {
                self.window.post_message(reply, origin, None);
            }
            Err(e) => warn!("Failed to encode handshake reply: {e}"),
        }
    }

    fn accept_transfer(&self, envelope: Envelope, port: MessagePort) {
        let kind = envelope.message.kind.clone();
        let (sender, inbox) = port.split();
        let port_id = sender.id();

        {
            // Check and register under one lock so two announcers cannot both
            // get in.
            let mut registry = self.registry.lock();
            if registry.has_responder_endpoint(&kind) {
                return;
            }
            let serve = carrier::serve_port(
                kind.clone(),
                self.stamp.namespace.clone(),
                inbox,
                sender.clone(),
                Arc::clone(&self.process),
                Arc::downgrade(&self.registry),
            );
            let endpoint = ResponderEndpoint::new(sender.clone(), envelope.instance_id.clone(), serve);
            registry.register_responder_endpoint(&kind, endpoint);
        }
        debug!(
            "[messaging/window] accepted port {port_id} for {kind} from {}",
            envelope.instance_id
        );

        let complete = self
            .stamp
            .envelope(ProtocolKind::TransferPortComplete, &envelope.message)
            .to_value()
            .map_err(MessagingError::from)
            .and_then(|complete| sender.post_message(complete));
        if let Err(e) = complete {
            warn!("[messaging/window] could not confirm transfer for {kind}: {e}");
            self.registry.lock().release_responder_if(&kind, port_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
