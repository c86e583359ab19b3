//! Window transport — private request/response channels negotiated over a
//! shared broadcast window.
//!
//! A call of kind `k` runs one cycle:
//!
//! 1. open a private [`MessageChannel`](crate::port::MessageChannel) for `k`;
//! 2. broadcast handshake-start until a remote messenger echoes
//!    handshake-complete;
//! 3. hand the responder endpoint over with transfer-port-start and wait for
//!    transfer-port-complete on the retained endpoint;
//! 4. post the request on the private channel, await the response, close
//!    the channel.
//!
//! The window only ever carries the handshake and transfer envelopes. Calls
//! of the same kind from one messenger run one after another; calls of
//! different kinds interleave freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::carrier::{self, Delivery};
use crate::config::MessengerConfig;
use crate::error::MessagingError;
use crate::identity::InstanceId;
use crate::message::{EnvelopeStamp, LogicalMessage, ProtocolKind};
use crate::messenger::{Messenger, MessagingTransport};
use crate::negotiator::{self, Negotiated};
use crate::pending::{CallStage, PendingCalls};
use crate::port::{ListenerHandle, PortSender};
use crate::registry::ChannelRegistry;
use crate::router::ProcessMessage;
use crate::transport::{ANY_ORIGIN, Window};

/// A messenger backed by a broadcast window.
pub type WindowMessenger = Messenger<WindowTransport>;

/// Build a [`WindowMessenger`] for `config.namespace` on `window`.
///
/// ```rust,no_run
/// use bridge_messaging::{MessengerConfig, Window, define_window_messaging};
///
/// # async fn example() -> Result<(), bridge_messaging::MessagingError> {
/// let window = Window::new("https://example.com");
/// let page = define_window_messaging(MessengerConfig::new("demo"), &window)?;
/// let injected = define_window_messaging(MessengerConfig::new("demo"), &window)?;
///
/// injected.on_message("ping", |_msg| async { Ok(serde_json::json!("pong")) })?;
/// let pong = page.send_message("ping", serde_json::Value::Null, None).await?;
/// assert_eq!(pong, "pong");
/// # Ok(())
/// # }
/// ```
pub fn define_window_messaging(
    config: MessengerConfig,
    window: &Window,
) -> Result<WindowMessenger, MessagingError> {
    config.validate()?;
    let transport = WindowTransport::new(&config, window.clone());
    Ok(Messenger::new(config, transport))
}

/// State shared by the negotiator, the carrier and their listener tasks.
pub(crate) struct WindowState {
    pub(crate) stamp: EnvelopeStamp,
    pub(crate) window: Window,
    pub(crate) retry_interval: Duration,
    pub(crate) registry: Arc<Mutex<ChannelRegistry>>,
    pub(crate) pending: Arc<Mutex<PendingCalls>>,
    kind_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Bumped by every teardown. A call started in an older epoch is
    /// abandoned.
    epoch: AtomicU64,
}

impl WindowState {
    /// Broadcast a negotiation envelope for `message`.
    pub(crate) fn broadcast(
        &self,
        protocol_kind: ProtocolKind,
        message: &LogicalMessage,
        target_origin: &str,
    ) -> Result<usize, MessagingError> {
        let envelope = self.stamp.envelope(protocol_kind, message).to_value()?;
        Ok(self.window.post_message(envelope, target_origin, None))
    }

    /// Retained endpoint for `kind`, opening the channel (and its listener)
    /// if needed.
    pub(crate) fn ensure_sender_channel(&self, kind: &str) -> PortSender {
        let pending = Arc::clone(&self.pending);
        let namespace = self.stamp.namespace.clone();
        self.registry.lock().ensure_sender_channel(kind, |inbox| {
            carrier::listen_sender_port(kind.to_string(), namespace, inbox, pending)
        })
    }

    /// Close the channel for `kind` and forget its call.
    pub(crate) fn cleanup(&self, kind: &str) {
        self.registry.lock().release_channel(kind);
        self.pending.lock().finish(kind);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a teardown happened after `epoch` was read.
    pub(crate) fn torn_down_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// The lock serialising calls of `kind`. Locks nobody holds or waits on
    /// are dropped here, so the table only tracks kinds in use.
    fn kind_lock(&self, kind: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.kind_locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(kind.to_string()).or_default())
    }
}

/// Window-backed [`MessagingTransport`].
pub struct WindowTransport {
    state: Arc<WindowState>,
}

impl WindowTransport {
    pub fn new(config: &MessengerConfig, window: Window) -> Self {
        let stamp = EnvelopeStamp {
            namespace: config.namespace.clone(),
            instance_id: InstanceId::generate(),
            sender_origin: window.origin().to_string(),
        };
        debug!(
            "[messaging/window] messenger {} ready on namespace {}",
            stamp.instance_id, stamp.namespace
        );
        Self {
            state: Arc::new(WindowState {
                stamp,
                window,
                retry_interval: config.retry_interval,
                registry: Arc::new(Mutex::new(ChannelRegistry::new())),
                pending: Arc::new(Mutex::new(PendingCalls::new())),
                kind_locks: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Identity stamped on every envelope this transport posts.
    pub fn instance_id(&self) -> &InstanceId {
        &self.state.stamp.instance_id
    }

    /// Namespace this transport listens to.
    pub fn namespace(&self) -> &str {
        &self.state.stamp.namespace
    }

    /// The window this transport is attached to.
    pub fn window(&self) -> &Window {
        &self.state.window
    }

    /// Number of live sender channels.
    pub fn sender_channel_count(&self) -> usize {
        self.state.registry.lock().sender_count()
    }

    /// Number of endpoints received from remote announcers.
    pub fn responder_endpoint_count(&self) -> usize {
        self.state.registry.lock().responder_count()
    }

    /// Whether a sender channel for `kind` is open.
    pub fn has_sender_channel(&self, kind: &str) -> bool {
        self.state.registry.lock().sender_channel(kind).is_some()
    }

    /// Whether an endpoint for `kind` has been accepted from a remote caller.
    pub fn has_responder_endpoint(&self, kind: &str) -> bool {
        self.state.registry.lock().has_responder_endpoint(kind)
    }

    /// Number of calls currently tracked.
    pub fn pending_call_count(&self) -> usize {
        self.state.pending.lock().len()
    }

    /// Stage of the in-flight call for `kind`.
    pub fn call_stage(&self, kind: &str) -> Option<CallStage> {
        self.state.pending.lock().stage(kind)
    }

    /// Run one full cycle for `message` on a channel of its kind.
    async fn run_call(
        &self,
        message: &LogicalMessage,
        target_origin: &str,
        epoch: u64,
    ) -> Result<Delivery, MessagingError> {
        match negotiator::negotiate(&self.state, message, target_origin, epoch).await? {
            Negotiated::Ready => carrier::request(&self.state, message, epoch).await,
            Negotiated::Abandoned => Ok(Delivery::Abandoned),
        }
    }
}

/// Releases a call's channel and table entry when the call ends, however it
/// ends (including the caller dropping the future).
struct CallCleanup<'a> {
    state: &'a WindowState,
    kind: &'a str,
}

impl<'a> CallCleanup<'a> {
    fn new(state: &'a WindowState, kind: &'a str) -> Self {
        Self { state, kind }
    }
}

impl Drop for CallCleanup<'_> {
    fn drop(&mut self) {
        self.state.cleanup(self.kind);
    }
}

/// Park a call abandoned by teardown. It never resolves.
async fn abandoned(message: &LogicalMessage) -> Result<Value, MessagingError> {
    debug!(
        "[messaging/window] call abandoned by teardown. {{id={} type={}}}",
        message.id, message.kind
    );
    std::future::pending().await
}

#[async_trait]
impl MessagingTransport for WindowTransport {
    async fn send_message(
        &self,
        message: LogicalMessage,
        target_origin: Option<&str>,
    ) -> Result<Value, MessagingError> {
        let kind = message.kind.clone();
        let target_origin = target_origin.unwrap_or(ANY_ORIGIN);

        // Read before queueing on the kind lock: a teardown while this call
        // waits abandons it too.
        let epoch = self.state.epoch();
        let lock = self.state.kind_lock(&kind);
        let guard = lock.lock_owned().await;
        if self.state.torn_down_since(epoch) {
            drop(guard);
            return abandoned(&message).await;
        }
        // Dropped before the kind lock, so a cancelled call is cleaned up
        // before the next call of its kind can begin.
        let call = CallCleanup::new(&self.state, &kind);

        match self.run_call(&message, target_origin, epoch).await {
            Ok(Delivery::Response(response)) => Ok(response),
            Ok(Delivery::Abandoned) => {
                // Anything the call recreated while racing the teardown goes
                // now, while no other call of this kind can start.
                drop(call);
                drop(guard);
                abandoned(&message).await
            }
            Err(_) if self.state.torn_down_since(epoch) => {
                drop(call);
                drop(guard);
                abandoned(&message).await
            }
            Err(err) => Err(err),
        }
    }

    fn add_root_listener(&self, process: ProcessMessage) -> ListenerHandle {
        negotiator::spawn_root_listener(&self.state, process)
    }

    fn remove_all_listeners(&self) {
        // Epoch first: any step failing because of the clearing below
        // already sees the teardown.
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        let abandoned = self.state.pending.lock().abandon_all();
        let released = self.state.registry.lock().release_all();
        debug!(
            "[messaging/window] removed all listeners ({abandoned} calls abandoned, {released} endpoints closed)"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
