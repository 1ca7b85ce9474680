//! One cable client.
//!
//! A [`CableSession`] turns [`CableRequest`]s into calls on the hypervisor
//! pool and sends every outcome back as a [`CablePush`] on its outbound
//! channel.  It never writes to a socket itself, so the whole request flow
//! can be tested with a plain `mpsc` receiver.
//!
//! # What runs where
//!
//! | Request          | Work                                                   |
//! |------------------|--------------------------------------------------------|
//! | `Subscribe`      | registers an event callback; events are forwarded from |
//! |                  | the subscription's worker thread                       |
//! | `Unsubscribe`    | terminates one of this session's subscriptions         |
//! | `SetState`       | spawned task: transition on the blocking pool, then a  |
//! |                  | fresh snapshot is pushed                               |
//! | `TakeScreenshot` | spawned task: stream the image, write it to disk, push |
//! |                  | the file name                                          |
//!
//! Failures of any request come back as `CablePush::Error` with the public
//! message; nothing is dropped silently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmgate_core::protocol::cable::request_type_name;
use vmgate_core::{
    CablePush, CableRequest, Command, DomainSnapshot, EventKind, VirtError, VirtualMachineView,
};

use super::catalog::HypervisorPool;
use super::connection::Connection;
use super::events::{CallbackError, EventDelivery, SubscriptionToken};
use super::screenshot;
use super::snapshot;
use super::transition::transition_blocking;

/// Upper bound on one capture unless the session is configured otherwise.
pub const DEFAULT_SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// State of one connected cable client.
pub struct CableSession {
    pool: Arc<HypervisorPool>,
    screenshot_dir: PathBuf,
    screenshot_timeout: Duration,
    outbound: UnboundedSender<CablePush>,
    subscriptions: HashMap<Uuid, (Connection, SubscriptionToken)>,
    screenshots: Vec<JoinHandle<()>>,
}

impl CableSession {
    pub fn new(
        pool: Arc<HypervisorPool>,
        screenshot_dir: PathBuf,
        outbound: UnboundedSender<CablePush>,
    ) -> Self {
        Self {
            pool,
            screenshot_dir,
            screenshot_timeout: DEFAULT_SCREENSHOT_TIMEOUT,
            outbound,
            subscriptions: HashMap::new(),
            screenshots: Vec::new(),
        }
    }

    /// Replaces [`DEFAULT_SCREENSHOT_TIMEOUT`] for this session's captures.
    pub fn with_screenshot_timeout(mut self, limit: Duration) -> Self {
        self.screenshot_timeout = limit;
        self
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Handles one request.  Results arrive on the outbound channel.
    pub async fn handle(&mut self, request: CableRequest) {
        debug!(request = request_type_name(&request), "cable request");
        let result = match request {
            CableRequest::Subscribe {
                virtual_machine_id,
                event,
            } => self.subscribe(virtual_machine_id, event).await,
            CableRequest::Unsubscribe { subscription_id } => self.unsubscribe(subscription_id),
            CableRequest::SetState {
                virtual_machine_id,
                command,
            } => self.set_state(virtual_machine_id, &command),
            CableRequest::TakeScreenshot {
                virtual_machine_id,
                display,
            } => {
                self.take_screenshot(virtual_machine_id, display);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(error = %err, "cable request failed");
            self.push(CablePush::from(err.to_api_error()));
        }
    }

    /// Ends the session: unsubscribes everything and cancels screenshots in
    /// flight.  Safe to call more than once.
    pub fn close(&mut self) {
        for (_, (conn, token)) in self.subscriptions.drain() {
            if let Err(err) = conn.unsubscribe(token) {
                debug!(subscription = %token, error = %err, "subscription already ended");
            }
        }
        for task in self.screenshots.drain(..) {
            // Dropping the task's `ScreenshotStream` cancels the stream.
            task.abort();
        }
    }

    async fn subscribe(
        &mut self,
        virtual_machine_id: String,
        kind: EventKind,
    ) -> Result<(), VirtError> {
        let pool = Arc::clone(&self.pool);
        let id = virtual_machine_id.clone();
        let domain = run_blocking(move || pool.find_domain(&id)).await?;

        let conn = domain.connection().clone();
        let token =
            conn.register_event_callback(kind, &domain, self.outbound.clone(), forward_event)?;
        self.subscriptions.insert(token.0, (conn, token));

        info!(
            subscription = %token,
            vm = %virtual_machine_id,
            kind = kind.as_str(),
            "cable subscribed"
        );
        self.push(CablePush::Subscribed {
            subscription_id: token.0,
            virtual_machine_id,
            event: kind,
        });
        Ok(())
    }

    fn unsubscribe(&mut self, subscription_id: Uuid) -> Result<(), VirtError> {
        let (conn, token) = self
            .subscriptions
            .remove(&subscription_id)
            .ok_or_else(|| {
                VirtError::InvalidState(format!("subscription {subscription_id} is not active"))
            })?;
        conn.unsubscribe(token)?;
        self.push(CablePush::Unsubscribed { subscription_id });
        Ok(())
    }

    fn set_state(&mut self, virtual_machine_id: String, command: &str) -> Result<(), VirtError> {
        // Rejected here, before any hypervisor call.
        let command: Command = command.parse()?;
        let pool = Arc::clone(&self.pool);
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let push = match apply_state(pool, virtual_machine_id, command).await {
                Ok(snapshot) => CablePush::VirtualMachineUpdated {
                    virtual_machine: VirtualMachineView::from(&snapshot),
                },
                Err(err) => {
                    warn!(%command, error = %err, "transition failed");
                    CablePush::from(err.to_api_error())
                }
            };
            let _ = outbound.send(push);
        });
        Ok(())
    }

    fn take_screenshot(&mut self, virtual_machine_id: String, display: u32) {
        let pool = Arc::clone(&self.pool);
        let dir = self.screenshot_dir.clone();
        let limit = self.screenshot_timeout;
        let outbound = self.outbound.clone();

        self.screenshots.retain(|task| !task.is_finished());
        self.screenshots.push(tokio::spawn(async move {
            let push = match save_screenshot(pool, dir, virtual_machine_id, display, limit).await {
                Ok(push) => push,
                Err(err) => {
                    warn!(error = %err, "screenshot failed");
                    CablePush::from(err.to_api_error())
                }
            };
            let _ = outbound.send(push);
        }));
    }

    /// Queues a push for the client.
    pub fn push(&self, push: CablePush) {
        // The receiver is gone only once the client disconnected.
        let _ = self.outbound.send(push);
    }
}

impl Drop for CableSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscription callback: forwards the event to the client.
fn forward_event(
    delivery: &EventDelivery<'_>,
    outbound: &UnboundedSender<CablePush>,
) -> Result<(), CallbackError> {
    outbound
        .send(CablePush::DomainEvent {
            subscription_id: delivery.token.0,
            virtual_machine_id: delivery.domain.id().to_string(),
            sequence: delivery.event.sequence,
            event: delivery.event.payload.clone(),
        })
        .map_err(|_| CallbackError::new("cable client disconnected"))
}

async fn apply_state(
    pool: Arc<HypervisorPool>,
    virtual_machine_id: String,
    command: Command,
) -> Result<DomainSnapshot, VirtError> {
    let domain = run_blocking(move || pool.find_domain(&virtual_machine_id)).await?;
    transition_blocking(domain.clone(), command).await?;
    run_blocking(move || snapshot::refresh(&domain)).await
}

async fn save_screenshot(
    pool: Arc<HypervisorPool>,
    dir: PathBuf,
    virtual_machine_id: String,
    display: u32,
    limit: Duration,
) -> Result<CablePush, VirtError> {
    let id = virtual_machine_id.clone();
    let stream = run_blocking(move || {
        let domain = pool.find_domain(&id)?;
        screenshot::capture(&domain, display)
    })
    .await?;

    let mime_type = stream.mime_type();
    let image = match tokio::time::timeout(limit, stream.collect()).await {
        Ok(collected) => collected?,
        Err(_) => {
            return Err(VirtError::Stream(format!(
                "screenshot of {virtual_machine_id} timed out after {}s",
                limit.as_secs_f32()
            )));
        }
    };

    let file = format!("{virtual_machine_id}.png");
    let path = dir.join(&file);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| VirtError::Stream(format!("creating {}: {err}", dir.display())))?;
    tokio::fs::write(&path, &image)
        .await
        .map_err(|err| VirtError::Stream(format!("writing {}: {err}", path.display())))?;

    info!(
        vm = %virtual_machine_id,
        bytes = image.len(),
        path = %path.display(),
        "screenshot saved"
    );
    Ok(CablePush::ScreenshotReady {
        virtual_machine_id,
        file,
        mime_type,
        size: image.len(),
    })
}

/// Runs a blocking hypervisor call on tokio's blocking pool.
async fn run_blocking<T, F>(work: F) -> Result<T, VirtError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, VirtError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| VirtError::operation_failed("blocking task", err.to_string()))?
}
