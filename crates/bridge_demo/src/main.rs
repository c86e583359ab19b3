//! Demo: a "page" context and an "injected" context on one window, each
//! serving one kind and calling the other's.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use bridge_messaging::{MessengerConfig, Protocol, Window, WindowMessenger, define_window_messaging};

const DEFAULT_NAMESPACE: &str = "@bridge/messaging-demo/google";
const PAGE_ORIGIN: &str = "https://www.google.com";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Served by the injected script.
struct Ping;

impl Protocol for Ping {
    const KIND: &'static str = "ping";
    type Request = ();
    type Response = String;
}

/// Served by the page.
struct FromInjected;

impl Protocol for FromInjected {
    const KIND: &'static str = "fromInjected";
    type Request = ();
    type Response = String;
}

/// Served by the injected script; the reply carries structured data.
struct Ping2;

#[derive(Debug, Serialize, Deserialize)]
struct ReactProps {
    #[serde(rename = "reactProps")]
    react_props: Vec<ReactProp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReactProp {
    #[serde(rename = "className")]
    class_name: String,
}

impl Protocol for Ping2 {
    const KIND: &'static str = "ping2";
    type Request = ();
    type Response = ReactProps;
}

/// Config from the path given as the first argument, or the built-in
/// namespace.
fn load_config() -> Result<MessengerConfig> {
    match std::env::args().nth(1) {
        Some(path) => MessengerConfig::load_from_file(std::path::Path::new(&path))
            .with_context(|| format!("Failed to load messenger config from {path}")),
        None => Ok(MessengerConfig::new(DEFAULT_NAMESPACE)),
    }
}

fn setup_injected(messenger: &WindowMessenger) -> Result<()> {
    messenger.on::<Ping, _, _>(|()| async {
        info!("[injected] received ping");
        Ok("pong".to_string())
    })?;
    messenger.on::<Ping2, _, _>(|()| async {
        info!("[injected] received ping2");
        Ok(ReactProps {
            react_props: vec![ReactProp {
                class_name: "ml-md".to_string(),
            }],
        })
    })?;
    Ok(())
}

fn setup_page(messenger: &WindowMessenger) -> Result<()> {
    messenger.on::<FromInjected, _, _>(|()| async {
        info!("[page] received fromInjected");
        Ok("hello from the page".to_string())
    })?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = match bridge_core::init_logging() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        }
    };

    let config = load_config()?;
    info!("Starting messaging demo on namespace {}", config.namespace);

    let window = Window::new(PAGE_ORIGIN);
    let page = define_window_messaging(config.clone(), &window)?;
    let injected = define_window_messaging(config, &window.with_origin(PAGE_ORIGIN))?;

    setup_injected(&injected)?;
    setup_page(&page)?;

    let (pong, from_injected, props) = tokio::time::timeout(CALL_TIMEOUT, async {
        tokio::join!(
            page.send::<Ping>(()),
            injected.send::<FromInjected>(()),
            page.send::<Ping2>(()),
        )
    })
    .await
    .context("Demo calls timed out")?;

    info!("[page] ping -> {}", pong?);
    info!("[injected] fromInjected -> {}", from_injected?);
    info!("[page] ping2 -> {:?}", props?);

    page.remove_all_listeners();
    injected.remove_all_listeners();
    info!("Demo finished");
    Ok(())
}
