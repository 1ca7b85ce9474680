//! WebSocket server: accept loop and per-client session tasks.
//!
//! Each accepted connection runs in its own Tokio task with two halves:
//!
//! - **Browser → Session**: the task reads JSON frames and hands each parsed
//!   `CableRequest` to the client's [`CableSession`].
//! - **Session → Browser**: a writer task drains the session's outbound
//!   channel and sends every `CablePush` as a text frame.
//!
//! Shutdown is triggered by a shared `AtomicBool` that `main.rs` clears on
//! Ctrl+C; the accept loop polls it every 200 ms.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use vmgate_core::{CablePush, CableRequest, ErrorKind};

use crate::application::cable_session::CableSession;
use crate::application::catalog::HypervisorPool;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CableServerConfig {
    pub bind_addr: SocketAddr,
    /// Where `TakeScreenshot` writes its files.
    pub screenshot_dir: PathBuf,
    /// Upper bound on one `TakeScreenshot` capture.
    pub screenshot_timeout: Duration,
}

/// A bound cable listener.
pub struct CableServer {
    listener: TcpListener,
    pool: Arc<HypervisorPool>,
    screenshot_dir: PathBuf,
    screenshot_timeout: Duration,
}

// ── Public API ────────────────────────────────────────────────────────────────

impl CableServer {
    /// Binds the listener.  Port 0 picks a free port; see [`local_addr`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., the port is
    /// already in use).
    ///
    /// [`local_addr`]: CableServer::local_addr
    pub async fn bind(
        config: CableServerConfig,
        pool: Arc<HypervisorPool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind cable listener on {}", config.bind_addr))?;

        Ok(Self {
            listener,
            pool,
            screenshot_dir: config.screenshot_dir,
            screenshot_timeout: config.screenshot_timeout,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("cable listener has no local address")
    }

    /// Accepts clients until `running` is set to `false`.
    pub async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        info!("cable listening on {}", self.local_addr()?);

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping cable accept loop");
                break;
            }

            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    info!("new cable connection from {peer_addr}");
                    let pool = Arc::clone(&self.pool);
                    let dir = self.screenshot_dir.clone();
                    let capture_timeout = self.screenshot_timeout;
                    tokio::spawn(async move {
                        handle_client(stream, peer_addr, pool, dir, capture_timeout).await;
                    });
                }
                Ok(Err(e)) => {
                    error!("cable accept error: {e}");
                }
                Err(_) => {
                    // No connection within the poll interval.
                }
            }
        }

        Ok(())
    }
}

// ── Per-client handler ────────────────────────────────────────────────────────

async fn handle_client(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<HypervisorPool>,
    screenshot_dir: PathBuf,
    screenshot_timeout: Duration,
) {
    match run_client(raw_stream, peer_addr, pool, screenshot_dir, screenshot_timeout).await {
        Ok(()) => info!("cable client {peer_addr} closed normally"),
        Err(e) => warn!("cable client {peer_addr} closed with error: {e:#}"),
    }
}

async fn run_client(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<HypervisorPool>,
    screenshot_dir: PathBuf,
    screenshot_timeout: Duration,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(raw_stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<CablePush>();
    let mut session = CableSession::new(pool, screenshot_dir, outbound_tx)
        .with_screenshot_timeout(screenshot_timeout);

    // ── Session → Browser ─────────────────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(push) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&push) {
                Ok(json) => json,
                Err(e) => {
                    error!("cable {peer_addr}: JSON serialization error: {e}");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                debug!("cable {peer_addr}: send failed (client disconnected)");
                break;
            }
        }
    });

    // ── Browser → Session ─────────────────────────────────────────────────────
    loop {
        let ws_msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                debug!("cable {peer_addr}: WebSocket closed");
                break;
            }
            Some(Err(e)) => {
                warn!("cable {peer_addr}: WebSocket error: {e}");
                break;
            }
            None => break,
        };

        match ws_msg {
            WsMessage::Text(text) => match parse_request(&text) {
                Ok(request) => session.handle(request).await,
                Err(push) => {
                    warn!("cable {peer_addr}: malformed request");
                    session.push(push);
                }
            },
            WsMessage::Close(_) => {
                debug!("cable {peer_addr}: close frame received");
                break;
            }
            // Pings are answered by tungstenite; binary frames are not part
            // of the cable protocol.
            _ => {}
        }
    }

    let subscriptions = session.subscription_count();
    session.close();
    drop(session);
    writer.abort();
    debug!("cable {peer_addr}: released {subscriptions} subscription(s)");
    Ok(())
}

/// Parses one text frame; a malformed frame becomes an error push.
fn parse_request(text: &str) -> Result<CableRequest, CablePush> {
    serde_json::from_str(text).map_err(|e| CablePush::Error {
        kind: ErrorKind::InvalidCommand,
        message: format!("malformed cable request: {e}"),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
