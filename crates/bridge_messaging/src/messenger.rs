//! Messenger — the typed front end shared by every transport.
//!
//! A [`Messenger`] owns the handler table and the message-id counter; the
//! transport underneath only moves [`LogicalMessage`]s and calls back into
//! the dispatch layer for inbound ones.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::MessengerConfig;
use crate::error::MessagingError;
use crate::message::LogicalMessage;
use crate::port::ListenerHandle;
use crate::router::{DispatchResult, MessageRouter, ProcessMessage, handler_fn};

/// Moves logical messages between messengers.
#[async_trait]
pub trait MessagingTransport: Send + Sync + 'static {
    /// Deliver `message` and resolve with the raw response payload.
    async fn send_message(
        &self,
        message: LogicalMessage,
        target_origin: Option<&str>,
    ) -> Result<Value, MessagingError>;

    /// Start feeding inbound messages to `process`. Dropping the returned
    /// handle stops the listener.
    fn add_root_listener(&self, process: ProcessMessage) -> ListenerHandle;

    /// Tear down everything the transport holds open.
    fn remove_all_listeners(&self) {}
}

/// A message kind with typed request and response payloads.
///
/// ```rust
/// use bridge_messaging::Protocol;
///
/// struct Ping;
///
/// impl Protocol for Ping {
///     const KIND: &'static str = "ping";
///     type Request = ();
///     type Response = String;
/// }
/// ```
pub trait Protocol {
    const KIND: &'static str;
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

struct MessengerInner<T> {
    config: MessengerConfig,
    transport: T,
    router: Arc<RwLock<MessageRouter>>,
    root_listener: Mutex<Option<ListenerHandle>>,
    next_id: AtomicU64,
}

/// Send requests and serve handlers over a [`MessagingTransport`].
pub struct Messenger<T: MessagingTransport> {
    inner: Arc<MessengerInner<T>>,
}

impl<T: MessagingTransport> std::fmt::Debug for Messenger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger").finish_non_exhaustive()
    }
}

impl<T: MessagingTransport> Clone for Messenger<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: MessagingTransport> Messenger<T> {
    pub fn new(config: MessengerConfig, transport: T) -> Self {
        Self {
            inner: Arc::new(MessengerInner {
                config,
                transport,
                router: Arc::new(RwLock::new(MessageRouter::new())),
                root_listener: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Register the handler for `kind`. The transport starts listening with
    /// the first handler.
    pub fn on_message<F, Fut>(&self, kind: &str, handler: F) -> Result<HandlerRegistration<T>, MessagingError>
    where
        F: Fn(LogicalMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner.router.write().register(kind, handler_fn(handler))?;

        let mut root = self.inner.root_listener.lock();
        if root.is_none() {
            debug!("[messaging] installing root listener for {}", self.inner.config.namespace);
            let process = MessageRouter::processor(Arc::clone(&self.inner.router));
            *root = Some(self.inner.transport.add_root_listener(process));
        }

        Ok(HandlerRegistration {
            kind: kind.to_string(),
            messenger: Arc::downgrade(&self.inner),
        })
    }

    /// Typed variant of [`on_message`](Self::on_message).
    pub fn on<P, F, Fut>(&self, handler: F) -> Result<HandlerRegistration<T>, MessagingError>
    where
        P: Protocol + 'static,
        F: Fn(P::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<P::Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_message(P::KIND, move |message| {
            let handler = Arc::clone(&handler);
            async move {
                let request: P::Request = serde_json::from_value(message.data)?;
                let response = handler(request).await?;
                Ok(serde_json::to_value(response)?)
            }
        })
    }

    /// Send `data` as a message of `kind` and wait for the remote handler's
    /// result. Never resolves if the messenger is torn down mid-call.
    pub async fn send_message(
        &self,
        kind: &str,
        data: Value,
        target_origin: Option<&str>,
    ) -> Result<Value, MessagingError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let message = LogicalMessage::new(id, kind, data);
        let response = self
            .inner
            .transport
            .send_message(message, target_origin)
            .await?;
        DispatchResult::decode(kind, response)
    }

    /// Typed variant of [`send_message`](Self::send_message).
    pub async fn send<P: Protocol>(&self, request: P::Request) -> Result<P::Response, MessagingError> {
        let data = serde_json::to_value(request)?;
        let response = self.send_message(P::KIND, data, None).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Drop every handler and tear the transport down. Calls still in
    /// flight are abandoned.
    pub fn remove_all_listeners(&self) {
        self.inner.router.write().clear();
        self.inner.root_listener.lock().take();
        self.inner.transport.remove_all_listeners();
    }

    pub fn handler_count(&self) -> usize {
        self.inner.router.read().handler_count()
    }

    pub fn has_handler(&self, kind: &str) -> bool {
        self.inner.router.read().has_handler(kind)
    }
}

/// Returned by [`Messenger::on_message`]; removes the handler again.
pub struct HandlerRegistration<T: MessagingTransport> {
    kind: String,
    messenger: Weak<MessengerInner<T>>,
}

impl<T: MessagingTransport> std::fmt::Debug for HandlerRegistration<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T: MessagingTransport> HandlerRegistration<T> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Unregister the handler. The root listener goes with the last one.
    pub fn remove(self) {
        let Some(inner) = self.messenger.upgrade() else {
            return;
        };
        let mut router = inner.router.write();
        router.unregister(&self.kind);
        if router.handler_count() == 0 {
            inner.root_listener.lock().take();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
