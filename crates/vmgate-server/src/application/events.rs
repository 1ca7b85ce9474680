//! Domain event subscriptions.
//!
//! # How delivery works
//!
//! ```text
//!  driver notification loop          worker thread (one per subscription)
//!  ────────────────────────          ────────────────────────────────────
//!  EventSink(event)  ──mpsc::send──▶ recv() → active? → callback(event, ctx)
//!    (returns immediately)                     │
//!                                              └─ errors and panics are logged
//! ```
//!
//! The driver fires its [`EventSink`] on its own delivery context, which must
//! never block.  The sink therefore only pushes the event into the
//! subscription's channel.  A dedicated worker thread drains the channel and
//! runs the user callback, so a slow or failing callback delays only its own
//! subscription and events reach it in emission order.
//!
//! Terminating a subscription clears its `active` flag before anything else.
//! The worker checks the flag before every callback, so once
//! [`EventRegistry::unsubscribe`] returns no further callback starts, even
//! for events already queued.  A callback that was already running when
//! `unsubscribe` was called runs to completion.
//!
//! The worker holds only a weak reference to the connection.  Dropping the
//! last [`Connection`](super::connection::Connection) clone therefore still
//! releases it, and the release terminates every remaining subscription.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;
use vmgate_core::{DomainEvent, EventKind, VirtError};

use super::connection::{map_driver_error, DomainHandle, WeakDomainHandle};
use super::driver::{CallbackId, EventSink, HypervisorDriver};
use super::lock;

/// Identifies one subscription; returned by `register_event_callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub Uuid);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    /// Terminal; a terminated subscription never becomes active again.
    Terminated,
}

/// Failure reported by a subscriber callback.  Logged, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What a subscriber callback receives for one event.
pub struct EventDelivery<'a> {
    pub token: SubscriptionToken,
    pub domain: &'a DomainHandle,
    pub event: &'a DomainEvent,
}

// ── Subscription internals ────────────────────────────────────────────────────

struct Subscription {
    token: SubscriptionToken,
    kind: EventKind,
    active: AtomicBool,
    sender: Mutex<Option<Sender<DomainEvent>>>,
    native: Mutex<Option<CallbackId>>,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Called on the driver's delivery context: enqueue only.
    fn enqueue(&self, event: DomainEvent) {
        if !self.is_active() {
            return;
        }
        if let Some(sender) = lock(&self.sender).as_ref() {
            // Fails only once the worker is gone, i.e. after termination.
            let _ = sender.send(event);
        }
    }

    /// Stops delivery.  Dropping the sender ends the worker loop.
    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        lock(&self.sender).take();
    }
}

// ── EventRegistry ─────────────────────────────────────────────────────────────

/// All subscriptions of one connection.
pub struct EventRegistry {
    driver: Arc<dyn HypervisorDriver>,
    uri: String,
    subscriptions: Mutex<HashMap<SubscriptionToken, Arc<Subscription>>>,
}

impl EventRegistry {
    pub fn new(driver: Arc<dyn HypervisorDriver>, uri: &str) -> Self {
        Self {
            driver,
            uri: uri.to_string(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `callback` for `kind` events of `domain`.
    pub fn subscribe<C, F>(
        &self,
        kind: EventKind,
        domain: DomainHandle,
        context: C,
        callback: F,
    ) -> Result<SubscriptionToken, VirtError>
    where
        C: Send + 'static,
        F: FnMut(&EventDelivery<'_>, &C) -> Result<(), CallbackError> + Send + 'static,
    {
        let token = SubscriptionToken(Uuid::new_v4());
        let domain_id = domain.id().to_string();
        let (tx, rx) = mpsc::channel();
        let subscription = Arc::new(Subscription {
            token,
            kind,
            active: AtomicBool::new(true),
            sender: Mutex::new(Some(tx)),
            native: Mutex::new(None),
        });

        // The worker exists before the driver can fire the first event.
        let worker_subscription = Arc::clone(&subscription);
        let worker_domain = domain.downgrade();
        thread::Builder::new()
            .name(format!("vm-events-{}", kind.as_str()))
            .spawn(move || run_worker(rx, worker_subscription, worker_domain, context, callback))
            .map_err(|err| VirtError::operation_failed("spawn event worker", err.to_string()))?;

        let sink_subscription = Arc::clone(&subscription);
        let sink: EventSink = Arc::new(move |event| sink_subscription.enqueue(event));

        match self.driver.domain_event_register_any(kind, &domain_id, sink) {
            Ok(native) => *lock(&subscription.native) = Some(native),
            Err(err) => {
                subscription.deactivate();
                return Err(map_driver_error(
                    &self.uri,
                    "domain_event_register_any",
                    None,
                    err,
                ));
            }
        }

        debug!(subscription = %token, domain = %domain_id, kind = kind.as_str(), "subscribed");
        lock(&self.subscriptions).insert(token, subscription);
        Ok(token)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), VirtError> {
        let subscription = lock(&self.subscriptions)
            .remove(&token)
            .ok_or_else(|| {
                VirtError::InvalidState(format!("subscription {token} is not active"))
            })?;
        self.terminate(&subscription)
    }

    pub fn state(&self, token: SubscriptionToken) -> SubscriptionState {
        if lock(&self.subscriptions).contains_key(&token) {
            SubscriptionState::Active
        } else {
            SubscriptionState::Terminated
        }
    }

    /// Terminates every subscription; used when the connection closes.
    pub fn terminate_all(&self) {
        let subscriptions: Vec<Arc<Subscription>> =
            lock(&self.subscriptions).drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            if let Err(err) = self.terminate(&subscription) {
                warn!(subscription = %subscription.token, error = %err, "deregistration failed");
            }
        }
    }

    fn terminate(&self, subscription: &Subscription) -> Result<(), VirtError> {
        subscription.deactivate();
        debug!(
            subscription = %subscription.token,
            kind = subscription.kind.as_str(),
            "unsubscribed"
        );
        match lock(&subscription.native).take() {
            Some(native) => self
                .driver
                .domain_event_deregister_any(native)
                .map_err(|err| {
                    map_driver_error(&self.uri, "domain_event_deregister_any", None, err)
                }),
            None => Ok(()),
        }
    }
}

fn run_worker<C, F>(
    rx: Receiver<DomainEvent>,
    subscription: Arc<Subscription>,
    domain: WeakDomainHandle,
    context: C,
    mut callback: F,
) where
    F: FnMut(&EventDelivery<'_>, &C) -> Result<(), CallbackError>,
{
    while let Ok(event) = rx.recv() {
        if !subscription.is_active() {
            break;
        }
        let handle = match domain.upgrade() {
            Some(handle) => handle,
            None => {
                debug!(
                    subscription = %subscription.token,
                    domain = %domain.id(),
                    "connection released, dropping event"
                );
                break;
            }
        };
        let delivery = EventDelivery {
            token: subscription.token,
            domain: &handle,
            event: &event,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| callback(&delivery, &context))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                subscription = %subscription.token,
                sequence = event.sequence,
                error = %err,
                "event callback failed"
            ),
            Err(_) => error!(
                subscription = %subscription.token,
                sequence = event.sequence,
                "event callback panicked"
            ),
        }
    }
    debug!(subscription = %subscription.token, "event worker stopped");
}
