//! Framebuffer capture over hypervisor streams.
//!
//! # Stream lifecycle
//!
//! ```text
//!            recv() → data            EOF
//!  Opened ─────────────────▶ Streaming ─────▶ Completed
//!    │                         │  │
//!    │                         │  └─ error ─▶ Failed
//!    └──────── cancel() ───────┴───────────▶ Cancelled
//! ```
//!
//! `Completed`, `Failed` and `Cancelled` are terminal: once a stream reaches
//! one of them its readability callback is removed and no handler runs
//! again.
//!
//! Two ways to take a screenshot:
//!
//! - [`take_screenshot`]: the caller supplies a handler that runs on the
//!   driver's delivery context each time the stream becomes readable.  This
//!   mirrors the native API.
//! - [`capture`]: the handler is provided here; it forwards chunks into a
//!   channel read from async code through [`ScreenshotStream`], which is a
//!   `futures` [`Stream`] of chunks.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;
use vmgate_core::VirtError;

use super::connection::{Connection, DomainHandle};
use super::driver::{DriverError, StreamDriver, StreamEvents, StreamRecv};
use super::lock;

/// Bytes read from the driver per `recv` call.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opened,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Opened => "opened",
            StreamState::Streaming => "streaming",
            StreamState::Completed => "completed",
            StreamState::Failed => "failed",
            StreamState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── StreamHandle ──────────────────────────────────────────────────────────────

/// A stream created on an open connection.  Clones share state.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

struct StreamShared {
    id: Uuid,
    conn: Connection,
    driver: Arc<dyn StreamDriver>,
    state: Mutex<StreamState>,
    mime_type: Mutex<Option<String>>,
    /// Consumer to wake when the stream is cancelled from elsewhere.
    reader: AtomicWaker,
}

/// Non-owning reference kept by the connection so close can cancel streams.
pub(crate) struct WeakStreamHandle(Weak<StreamShared>);

impl WeakStreamHandle {
    pub(crate) fn upgrade(&self) -> Option<StreamHandle> {
        self.0.upgrade().map(|shared| StreamHandle { shared })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl StreamHandle {
    pub(crate) fn new(conn: Connection, driver: Arc<dyn StreamDriver>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                id: Uuid::new_v4(),
                conn,
                driver,
                state: Mutex::new(StreamState::Opened),
                mime_type: Mutex::new(None),
                reader: AtomicWaker::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakStreamHandle {
        WeakStreamHandle(Arc::downgrade(&self.shared))
    }

    pub(crate) fn driver(&self) -> Arc<dyn StreamDriver> {
        Arc::clone(&self.shared.driver)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.shared.state)
    }

    /// MIME type announced by the hypervisor when the screenshot started.
    pub fn mime_type(&self) -> Option<String> {
        lock(&self.shared.mime_type).clone()
    }

    /// Registers `handler` to run each time the stream becomes readable.
    ///
    /// The handler runs on the driver's delivery context.  It is skipped once
    /// the stream is terminal.
    pub fn on_data<C, F>(&self, context: C, mut handler: F) -> Result<(), VirtError>
    where
        C: Send + 'static,
        F: FnMut(&StreamHandle, StreamEvents, &C) + Send + 'static,
    {
        self.ensure_usable()?;
        let weak = Arc::downgrade(&self.shared);
        let callback = Box::new(move |events: StreamEvents| {
            if let Some(shared) = weak.upgrade() {
                let stream = StreamHandle { shared };
                if !stream.state().is_terminal() {
                    handler(&stream, events, &context);
                }
            }
        });
        let interest = StreamEvents::READABLE
            .union(StreamEvents::ERROR)
            .union(StreamEvents::HANGUP);
        self.shared
            .driver
            .event_add_callback(interest, callback)
            .map_err(|err| self.stream_error(err))
    }

    /// Non-blocking read.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the stream is terminal or its connection is closed;
    /// `Stream` if the driver fails the read.
    pub fn recv(&self, buf: &mut [u8]) -> Result<StreamRecv, VirtError> {
        self.ensure_usable()?;
        let received = self
            .shared
            .driver
            .recv(buf)
            .map_err(|err| self.stream_error(err))?;
        if let StreamRecv::Data(_) = received {
            let mut state = lock(&self.shared.state);
            if *state == StreamState::Opened {
                *state = StreamState::Streaming;
            }
        }
        Ok(received)
    }

    /// Cancels the transfer.  Data buffered but not yet consumed is dropped.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the stream already reached a terminal state.
    pub fn cancel(&self) -> Result<(), VirtError> {
        if self.settle(StreamState::Cancelled) {
            debug!(stream = %self.shared.id, "stream cancelled");
            Ok(())
        } else {
            Err(VirtError::InvalidState(format!(
                "stream {} is already {}",
                self.shared.id,
                self.state()
            )))
        }
    }

    pub(crate) fn cancel_on_close(&self) {
        self.settle(StreamState::Cancelled);
    }

    pub(crate) fn complete(&self) {
        self.settle(StreamState::Completed);
    }

    pub(crate) fn fail(&self, err: VirtError) -> VirtError {
        self.settle(StreamState::Failed);
        err
    }

    fn ensure_usable(&self) -> Result<(), VirtError> {
        self.shared.conn.ensure_open()?;
        let state = self.state();
        if state.is_terminal() {
            return Err(VirtError::InvalidState(format!(
                "stream {} is {state}",
                self.shared.id
            )));
        }
        Ok(())
    }

    fn stream_error(&self, err: DriverError) -> VirtError {
        match err {
            DriverError::ConnectionLost(_) => self.shared.conn.driver_error("stream", None, err),
            DriverError::Operation(message) => VirtError::Stream(message),
        }
    }

    /// Moves into `outcome` and releases the driver side.  `false` if the
    /// stream was already terminal.
    fn settle(&self, outcome: StreamState) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.is_terminal() {
                return false;
            }
            *state = outcome;
        }
        self.shared.release(outcome);
        if outcome == StreamState::Cancelled {
            self.shared.reader.wake();
        }
        true
    }
}

impl StreamShared {
    fn release(&self, outcome: StreamState) {
        let result = match outcome {
            StreamState::Completed => self.driver.finish(),
            _ => self.driver.abort(),
        };
        if let Err(err) = result {
            warn!(stream = %self.id, %outcome, error = %err, "releasing stream failed");
        }
        if let Err(err) = self.driver.event_remove_callback() {
            debug!(stream = %self.id, error = %err, "stream callback already removed");
        }
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        let state = *self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            self.release(StreamState::Cancelled);
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

// ── Callback API ──────────────────────────────────────────────────────────────

/// Starts a screenshot of `display` and delivers readiness to `handler`.
///
/// The hypervisor is asked to begin writing the framebuffer first; the
/// handler is registered afterwards.  Returns the stream, already carrying
/// the image MIME type.
pub fn take_screenshot<C, F>(
    domain: &DomainHandle,
    display: u32,
    context: C,
    handler: F,
) -> Result<StreamHandle, VirtError>
where
    C: Send + 'static,
    F: FnMut(&StreamHandle, StreamEvents, &C) + Send + 'static,
{
    let conn = domain.connection();
    let stream = conn.create_stream()?;
    let driver = domain.driver()?;

    let mime_type = match driver.screenshot(stream.driver(), display) {
        Ok(mime_type) => mime_type,
        Err(err) => {
            stream.cancel_on_close();
            return Err(conn.driver_error("screenshot", None, err));
        }
    };
    let screen = display;
    debug!(
        domain = %domain.id(),
        screen,
        %mime_type,
        stream = %stream.id(),
        "screenshot started"
    );
    *lock(&stream.shared.mime_type) = Some(mime_type);

    if let Err(err) = stream.on_data(context, handler) {
        stream.cancel_on_close();
        return Err(err);
    }
    Ok(stream)
}

// ── Async chunk reader ────────────────────────────────────────────────────────

enum Delivery {
    Chunk(Vec<u8>),
    Completed,
    Failed(VirtError),
}

/// An in-progress screenshot read from async code.
///
/// Dropping it before the end cancels the underlying stream.
pub struct ScreenshotStream {
    handle: StreamHandle,
    rx: UnboundedReceiver<Delivery>,
    done: bool,
}

/// Starts a screenshot of `display` whose bytes are read with
/// [`ScreenshotStream::next_chunk`].
pub fn capture(domain: &DomainHandle, display: u32) -> Result<ScreenshotStream, VirtError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = take_screenshot(domain, display, tx, forward_chunks)?;
    Ok(ScreenshotStream {
        handle,
        rx,
        done: false,
    })
}

impl ScreenshotStream {
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    pub fn mime_type(&self) -> String {
        self.handle.mime_type().unwrap_or_default()
    }

    /// The next chunk, in stream order.
    ///
    /// `None` once the stream completed or was cancelled.  After a cancel,
    /// chunks that were already buffered are discarded.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, VirtError>> {
        self.next().await
    }

    /// Reads the whole image.
    ///
    /// # Errors
    ///
    /// The stream error if the transfer failed; `InvalidState` if it was
    /// cancelled before completing.
    pub async fn collect(mut self) -> Result<Vec<u8>, VirtError> {
        let mut image = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            image.extend_from_slice(&chunk?);
        }
        match self.handle.state() {
            StreamState::Completed => Ok(image),
            state => Err(VirtError::InvalidState(format!(
                "screenshot stream {} ended {state}",
                self.handle.id()
            ))),
        }
    }

    pub fn cancel(&self) -> Result<(), VirtError> {
        self.handle.cancel()
    }
}

impl Stream for ScreenshotStream {
    type Item = Result<Vec<u8>, VirtError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if this.handle.state() == StreamState::Cancelled {
                this.done = true;
                return Poll::Ready(None);
            }
            this.handle.shared.reader.register(cx.waker());
            // A cancel between the check above and registering would be missed.
            if this.handle.state() == StreamState::Cancelled {
                continue;
            }

            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Delivery::Chunk(chunk))) => {
                    if this.handle.state() == StreamState::Cancelled {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Poll::Ready(Some(Delivery::Completed)) | Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Delivery::Failed(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

impl Drop for ScreenshotStream {
    fn drop(&mut self) {
        if !self.handle.state().is_terminal() {
            self.handle.cancel_on_close();
        }
    }
}

/// Drains everything readable into the channel.  Runs on the driver's
/// delivery context.
fn forward_chunks(stream: &StreamHandle, events: StreamEvents, tx: &UnboundedSender<Delivery>) {
    if events.contains(StreamEvents::ERROR) {
        let err = stream.fail(VirtError::Stream(
            "hypervisor reported a stream error".to_string(),
        ));
        let _ = tx.send(Delivery::Failed(err));
        return;
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match stream.recv(&mut buf) {
            Ok(StreamRecv::Data(n)) => {
                if tx.send(Delivery::Chunk(buf[..n].to_vec())).is_err() {
                    stream.cancel_on_close();
                    return;
                }
            }
            Ok(StreamRecv::WouldBlock) => return,
            Ok(StreamRecv::Eof) => {
                stream.complete();
                let _ = tx.send(Delivery::Completed);
                return;
            }
            Err(err) => {
                if !stream.state().is_terminal() {
                    let err = stream.fail(err);
                    let _ = tx.send(Delivery::Failed(err));
                }
                return;
            }
        }
    }
}
