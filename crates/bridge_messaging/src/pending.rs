//! Pending-call table — the explicit state of every in-flight call, keyed by
//! message kind.
//!
//! The negotiator and carrier take one-shot receivers from here; the
//! listener on the retained endpoint resolves them. Clearing the table is
//! how teardown abandons calls: a receiver whose sender vanished tells its
//! call it will never be answered.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::MessagingError;

/// Where a call currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStage {
    /// Broadcasting handshake-start, waiting for an echo.
    Announcing,
    /// Responder endpoint is on the window, waiting for transfer-port-complete.
    Transferring,
    /// Private channel established.
    Transferred,
    /// Request posted, waiting for the response.
    AwaitingResponse,
}

/// How a transfer attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete,
    /// The transferred endpoint was dropped without being accepted.
    Rejected,
}

pub type ResponseResult = Result<Value, MessagingError>;

#[derive(Debug)]
struct PendingCall {
    message_id: u64,
    stage: CallStage,
    transfer_tx: Option<oneshot::Sender<TransferOutcome>>,
    response_tx: Option<oneshot::Sender<ResponseResult>>,
    peer_closed: bool,
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<String, PendingCall>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) negotiation for `kind`.
    pub fn begin(&mut self, kind: &str, message_id: u64) -> oneshot::Receiver<TransferOutcome> {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            message_id,
            stage: CallStage::Announcing,
            transfer_tx: Some(tx),
            response_tx: None,
            peer_closed: false,
        };
        if let Some(previous) = self.calls.insert(kind.to_string(), call) {
            debug!(
                "Restarting negotiation for {kind} (message {} replaced)",
                previous.message_id
            );
        }
        rx
    }

    /// The responder endpoint for `kind` is on the window.
    pub fn mark_transferring(&mut self, kind: &str) {
        if let Some(call) = self.calls.get_mut(kind) {
            call.stage = CallStage::Transferring;
        }
    }

    /// The remote side confirmed the transfer.
    pub fn complete_transfer(&mut self, kind: &str) -> bool {
        let Some(call) = self.calls.get_mut(kind) else {
            return false;
        };
        let Some(tx) = call.transfer_tx.take() else {
            return false;
        };
        call.stage = CallStage::Transferred;
        tx.send(TransferOutcome::Complete).is_ok()
    }

    /// Register for the response to the request about to be posted. `None`
    /// when the call is no longer tracked (abandoned by teardown).
    pub fn await_response(&mut self, kind: &str) -> Option<oneshot::Receiver<ResponseResult>> {
        let call = self.calls.get_mut(kind)?;
        let (tx, rx) = oneshot::channel();
        call.stage = CallStage::AwaitingResponse;
        if call.peer_closed {
            let _ = tx.send(Err(MessagingError::PortClosed(kind.to_string())));
        } else {
            call.response_tx = Some(tx);
        }
        Some(rx)
    }

    /// Deliver the response for `kind`. `false` when nobody is waiting.
    pub fn resolve_response(&mut self, kind: &str, result: ResponseResult) -> bool {
        let Some(tx) = self
            .calls
            .get_mut(kind)
            .and_then(|call| call.response_tx.take())
        else {
            return false;
        };
        tx.send(result).is_ok()
    }

    /// The remote end of the channel for `kind` went away.
    pub fn peer_closed(&mut self, kind: &str) {
        let Some(call) = self.calls.get_mut(kind) else {
            return;
        };
        call.peer_closed = true;
        match call.stage {
            CallStage::Transferring => {
                if let Some(tx) = call.transfer_tx.take() {
                    debug!("Transfer for {kind} (message {}) was rejected", call.message_id);
                    let _ = tx.send(TransferOutcome::Rejected);
                }
            }
            CallStage::AwaitingResponse => {
                if let Some(tx) = call.response_tx.take() {
                    let _ = tx.send(Err(MessagingError::PortClosed(kind.to_string())));
                }
            }
            CallStage::Announcing | CallStage::Transferred => {}
        }
    }

    /// Forget the call for `kind` once it has been answered.
    pub fn finish(&mut self, kind: &str) {
        self.calls.remove(kind);
    }

    /// Drop every call without answering it.
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.calls.len();
        self.calls.clear();
        abandoned
    }

    /// Current stage of the call for `kind`, if one is tracked.
    pub fn stage(&self, kind: &str) -> Option<CallStage> {
        self.calls.get(kind).map(|call| call.stage)
    }

    /// Number of tracked calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is tracked.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
