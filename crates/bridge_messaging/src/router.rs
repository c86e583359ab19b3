//! Message router — the dispatch layer mapping a logical message to the
//! handler registered for its kind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorDescriptor, MessagingError};
use crate::message::LogicalMessage;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A handler invoked with the inbound logical message.
pub type MessageHandler = Arc<dyn Fn(LogicalMessage) -> HandlerFuture + Send + Sync>;

/// Entry point a transport calls with every inbound logical message. Yields
/// the encoded result, or `None` when no handler exists for the kind.
pub type ProcessMessage =
    Arc<dyn Fn(LogicalMessage) -> Pin<Box<dyn Future<Output = Option<Value>> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(LogicalMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// What travels back as the response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchResult {
    Res(Value),
    Err(ErrorDescriptor),
}

impl DispatchResult {
    /// Encode a handler outcome.
    pub fn from_handler(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(value) => Self::Res(value),
            Err(err) => Self::Err(ErrorDescriptor::from_anyhow(&err)),
        }
    }

    /// The JSON form posted as the response payload.
    pub fn to_value(&self) -> Value {
        // A map of a plain Value or a struct of strings always serialises.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Interpret a response payload on the calling side.
    pub fn decode(kind: &str, response: Value) -> Result<Value, MessagingError> {
        if response.is_null() {
            return Err(MessagingError::NoResponse(kind.to_string()));
        }
        match serde_json::from_value::<DispatchResult>(response)? {
            Self::Res(value) => Ok(value),
            Self::Err(desc) => Err(MessagingError::Remote(desc)),
        }
    }
}

/// Handler table keyed by message kind. One handler per kind.
pub struct MessageRouter {
    handlers: HashMap<String, MessageHandler>,
}

impl MessageRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `kind`. Fails with
    /// [`MessagingError::DuplicateHandler`] if one is already registered.
    pub fn register(&mut self, kind: &str, handler: MessageHandler) -> Result<(), MessagingError> {
        if self.handlers.contains_key(kind) {
            return Err(MessagingError::DuplicateHandler(kind.to_string()));
        }
        debug!("Registering handler for message kind: {kind}");
        self.handlers.insert(kind.to_string(), handler);
        Ok(())
    }

    /// Remove the handler for `kind`. Returns whether one was registered.
    pub fn unregister(&mut self, kind: &str) -> bool {
        self.handlers.remove(kind).is_some()
    }

    /// Whether a handler is registered for `kind`.
    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// The handler registered for `kind`, if any.
    pub fn handler(&self, kind: &str) -> Option<MessageHandler> {
        self.handlers.get(kind).cloned()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Run the handler for `message`, if any, and encode its outcome.
    pub async fn dispatch(router: &RwLock<Self>, message: LogicalMessage) -> Option<Value> {
        let kind = message.kind.clone();
        let handler = router.read().handler(&kind);
        let Some(handler) = handler else {
            warn!("No handler for message kind: {kind}");
            return None;
        };

        debug!("Dispatching {kind} message {}", message.id);
        let result = DispatchResult::from_handler(handler(message).await);
        if let DispatchResult::Err(desc) = &result {
            debug!("Handler for {kind} failed: {desc}");
        }
        Some(result.to_value())
    }

    /// A [`ProcessMessage`] entry point bound to a shared router.
    pub fn processor(router: Arc<RwLock<Self>>) -> ProcessMessage {
        Arc::new(move |message| {
            let router = Arc::clone(&router);
            Box::pin(async move { Self::dispatch(&router, message).await })
        })
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
