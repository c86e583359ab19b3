//! Bridge Messaging — request/response messaging between contexts that
//! share a broadcast window.
//!
//! Two messengers in the same namespace find each other on the window,
//! negotiate a private channel per message kind, and exchange exactly one
//! request and one response over it before closing it again.
//!
//! # Architecture
//!
//! - **Window**: an in-process broadcast medium; every context sees every
//!   post and ports can be transferred alongside a message.
//! - **Negotiator**: handshake-start / handshake-complete, then hand-over of
//!   the responder endpoint with transfer-port-start / -complete.
//! - **Carrier**: the request and its response on the private channel.
//! - **Messenger**: handler table and typed sends on top of any
//!   [`MessagingTransport`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use bridge_messaging::{MessengerConfig, Window, define_window_messaging};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), bridge_messaging::MessagingError> {
//! let window = Window::new("https://example.com");
//! let page = define_window_messaging(MessengerConfig::new("my-extension"), &window)?;
//! let injected = define_window_messaging(MessengerConfig::new("my-extension"), &window)?;
//!
//! injected.on_message("ping", |_msg| async { Ok(json!("pong")) })?;
//! assert_eq!(page.send_message("ping", json!(null), None).await?, json!("pong"));
//!
//! page.remove_all_listeners();
//! injected.remove_all_listeners();
//! # Ok(())
//! # }
//! ```

mod carrier;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod messenger;
mod negotiator;
pub mod pending;
pub mod port;
pub mod registry;
pub mod router;
pub mod transport;
pub mod window;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::MessengerConfig;
pub use error::{ErrorDescriptor, MessagingError};
pub use identity::InstanceId;
pub use message::{Envelope, LogicalMessage, ProtocolKind};
pub use messenger::{HandlerRegistration, Messenger, MessagingTransport, Protocol};
pub use port::{ListenerHandle, MessageChannel, MessagePort};
pub use router::{MessageRouter, ProcessMessage};
pub use transport::{ANY_ORIGIN, Window, WindowEvent};
pub use window::{WindowMessenger, WindowTransport, define_window_messaging};
