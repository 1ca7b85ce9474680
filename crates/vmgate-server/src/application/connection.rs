//! Live hypervisor connections and the domain handles derived from them.
//!
//! A [`Connection`] is created by opening a driver for a URI.  Everything
//! obtained through it (domain handles, event subscriptions, streams) checks
//! that the connection is still open before each use, so after
//! [`Connection::close`] every derived object fails with `InvalidState`
//! instead of reaching a driver that is gone.
//!
//! Both [`Connection`] and [`DomainHandle`] are cheap to clone and safe to
//! move across threads; clones share the same underlying state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};
use vmgate_core::{Command, DomainAction, EventKind, HypervisorId, HypervisorInfo, VirtError};

use super::driver::{DomainDriver, DriverConnector, DriverError, HostInfo, HypervisorDriver};
use super::events::{
    CallbackError, EventDelivery, EventRegistry, SubscriptionState, SubscriptionToken,
};
use super::lock;
use super::screenshot::{StreamHandle, WeakStreamHandle};

// ── Connection ────────────────────────────────────────────────────────────────

/// An open (or closed) connection to one hypervisor host.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: HypervisorId,
    name: String,
    uri: String,
    driver: Arc<dyn HypervisorDriver>,
    host: HostInfo,
    closed: AtomicBool,
    events: EventRegistry,
    streams: Mutex<Vec<WeakStreamHandle>>,
}

impl Connection {
    /// Opens `uri` through `connector`.
    ///
    /// # Errors
    ///
    /// `VirtError::Connection` if the driver cannot be opened or does not
    /// answer the initial host query.
    pub fn open(
        id: HypervisorId,
        name: impl Into<String>,
        uri: &str,
        connector: &dyn DriverConnector,
    ) -> Result<Self, VirtError> {
        let driver = connector.open(uri).map_err(|err| VirtError::Connection {
            uri: uri.to_string(),
            message: err.message().to_string(),
        })?;
        Self::with_driver(id, name, uri, driver)
    }

    /// Wraps an already opened driver.
    pub fn with_driver(
        id: HypervisorId,
        name: impl Into<String>,
        uri: &str,
        driver: Arc<dyn HypervisorDriver>,
    ) -> Result<Self, VirtError> {
        let host = driver.host_info().map_err(|err| VirtError::Connection {
            uri: uri.to_string(),
            message: err.message().to_string(),
        })?;
        let name = name.into();
        info!(hypervisor = %id, %name, %uri, hostname = %host.hostname, "hypervisor connected");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id,
                name,
                uri: uri.to_string(),
                events: EventRegistry::new(Arc::clone(&driver), uri),
                driver,
                host,
                closed: AtomicBool::new(false),
                streams: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn id(&self) -> HypervisorId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Host information gathered when the connection was opened.
    pub fn info(&self) -> Result<HypervisorInfo, VirtError> {
        self.ensure_open()?;
        let host = &self.inner.host;
        Ok(HypervisorInfo {
            id: self.inner.id,
            name: self.inner.name.clone(),
            uri: self.inner.uri.clone(),
            hostname: host.hostname.clone(),
            version: host.version.clone(),
            lib_version: host.lib_version.clone(),
            max_vcpus: host.max_vcpus,
            node_info: host.node_info.clone(),
            capabilities: host.capabilities.clone(),
        })
    }

    /// Every domain defined on the host, in driver order.
    pub fn list_domains(&self) -> Result<Vec<DomainHandle>, VirtError> {
        self.ensure_open()?;
        let drivers = self
            .inner
            .driver
            .list_all_domains()
            .map_err(|err| self.driver_error("list_all_domains", None, err))?;

        drivers
            .into_iter()
            .map(|driver| {
                let uuid = driver
                    .uuid()
                    .map_err(|err| self.driver_error("uuid", None, err))?;
                Ok(DomainHandle::from_parts(self.clone(), driver, uuid))
            })
            .collect()
    }

    /// Finds a domain by UUID.
    ///
    /// # Errors
    ///
    /// `VirtError::NotFound` if no domain on this host has that UUID.
    pub fn lookup_domain(&self, uuid: &str) -> Result<DomainHandle, VirtError> {
        self.list_domains()?
            .into_iter()
            .find(|domain| domain.id() == uuid)
            .ok_or_else(|| VirtError::NotFound {
                resource: "virtual machine",
                id: uuid.to_string(),
            })
    }

    /// Creates a new stream on this connection.
    pub fn create_stream(&self) -> Result<StreamHandle, VirtError> {
        self.ensure_open()?;
        let driver = self
            .inner
            .driver
            .create_stream()
            .map_err(|err| self.driver_error("create_stream", None, err))?;
        let stream = StreamHandle::new(self.clone(), driver);

        let mut streams = lock(&self.inner.streams);
        streams.retain(WeakStreamHandle::is_alive);
        streams.push(stream.downgrade());
        Ok(stream)
    }

    /// Subscribes `callback` to `kind` events of `domain`.
    ///
    /// The callback runs on a dedicated worker thread, never on the driver's
    /// delivery context, and receives `context` by reference on every call.
    /// Events are delivered in emission order.
    ///
    /// # Errors
    ///
    /// `InvalidState` if this connection is closed or `domain` belongs to a
    /// different connection; `HypervisorOperation` if the driver refuses the
    /// registration.
    pub fn register_event_callback<C, F>(
        &self,
        kind: EventKind,
        domain: &DomainHandle,
        context: C,
        callback: F,
    ) -> Result<SubscriptionToken, VirtError>
    where
        C: Send + 'static,
        F: FnMut(&EventDelivery<'_>, &C) -> Result<(), CallbackError> + Send + 'static,
    {
        self.ensure_open()?;
        if !Arc::ptr_eq(&self.inner, &domain.conn.inner) {
            return Err(VirtError::InvalidState(format!(
                "virtual machine {} does not belong to hypervisor {}",
                domain.id(),
                self.inner.id
            )));
        }
        self.inner
            .events
            .subscribe(kind, domain.clone(), context, callback)
    }

    /// Stops a subscription.  No new callback starts after this returns; a
    /// callback already running when it is called is allowed to finish.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the token is unknown or already terminated;
    /// `Connection` or `HypervisorOperation` if the driver fails to release
    /// the native registration.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), VirtError> {
        self.inner.events.unsubscribe(token)
    }

    pub fn subscription_state(&self, token: SubscriptionToken) -> SubscriptionState {
        self.inner.events.state(token)
    }

    /// Closes the connection.
    ///
    /// Terminates every subscription, cancels every unfinished stream and
    /// releases the driver.  A second close fails with `InvalidState`.
    pub fn close(&self) -> Result<(), VirtError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(VirtError::InvalidState(format!(
                "connection to {} is already closed",
                self.inner.uri
            )));
        }
        info!(hypervisor = %self.inner.id, uri = %self.inner.uri, "closing hypervisor connection");

        self.inner.events.terminate_all();

        let streams: Vec<WeakStreamHandle> = lock(&self.inner.streams).drain(..).collect();
        for stream in streams.iter().filter_map(WeakStreamHandle::upgrade) {
            if !stream.state().is_terminal() {
                debug!(stream = %stream.id(), "cancelling stream on close");
                stream.cancel_on_close();
            }
        }

        self.inner.driver.close().map_err(|err| VirtError::Connection {
            uri: self.inner.uri.clone(),
            message: err.message().to_string(),
        })
    }

    pub(crate) fn ensure_open(&self) -> Result<(), VirtError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(VirtError::InvalidState(format!(
                "connection to {} is closed",
                self.inner.uri
            )))
        }
    }

    /// Maps a native failure of `operation` into the shared taxonomy.
    pub(crate) fn driver_error(
        &self,
        operation: &str,
        command: Option<Command>,
        err: DriverError,
    ) -> VirtError {
        map_driver_error(&self.inner.uri, operation, command, err)
    }

    pub(crate) fn transition_error(
        &self,
        command: Command,
        action: DomainAction,
        err: DriverError,
    ) -> VirtError {
        self.driver_error(&action.to_string(), Some(command), err)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("uri", &self.inner.uri)
            .field("open", &self.is_open())
            .finish()
    }
}

/// `ConnectionLost` becomes `Connection`; anything else is a rejected
/// `operation`.
pub(crate) fn map_driver_error(
    uri: &str,
    operation: &str,
    command: Option<Command>,
    err: DriverError,
) -> VirtError {
    match err {
        DriverError::ConnectionLost(message) => VirtError::Connection {
            uri: uri.to_string(),
            message,
        },
        DriverError::Operation(message) => VirtError::HypervisorOperation {
            operation: operation.to_string(),
            command,
            message,
        },
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(uri = %self.uri, "hypervisor connection dropped without close");
            self.events.terminate_all();
            if let Err(err) = self.driver.close() {
                warn!(
                    uri = %self.uri,
                    error = %err,
                    "closing dropped hypervisor connection failed"
                );
            }
        }
    }
}

// ── DomainHandle ──────────────────────────────────────────────────────────────

/// A live handle to one domain on an open connection.
#[derive(Clone)]
pub struct DomainHandle {
    conn: Connection,
    driver: Arc<dyn DomainDriver>,
    id: String,
}

impl DomainHandle {
    pub(crate) fn from_parts(conn: Connection, driver: Arc<dyn DomainDriver>, id: String) -> Self {
        Self { conn, driver, id }
    }

    /// Domain UUID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn hypervisor_id(&self) -> HypervisorId {
        self.conn.id()
    }

    /// `false` once the owning connection is closed.
    pub fn is_valid(&self) -> bool {
        self.conn.is_open()
    }

    /// The driver, if the owning connection is still open.
    pub(crate) fn driver(&self) -> Result<&dyn DomainDriver, VirtError> {
        self.conn.ensure_open()?;
        Ok(self.driver.as_ref())
    }

    /// A handle that does not keep the connection alive.
    pub(crate) fn downgrade(&self) -> WeakDomainHandle {
        WeakDomainHandle {
            conn: Arc::downgrade(&self.conn.inner),
            driver: Arc::clone(&self.driver),
            id: self.id.clone(),
        }
    }
}

/// Non-owning form of [`DomainHandle`], held by event workers.
pub(crate) struct WeakDomainHandle {
    conn: Weak<ConnectionInner>,
    driver: Arc<dyn DomainDriver>,
    id: String,
}

impl WeakDomainHandle {
    /// `None` once every [`Connection`] clone was dropped.
    pub(crate) fn upgrade(&self) -> Option<DomainHandle> {
        let inner = self.conn.upgrade()?;
        Some(DomainHandle {
            conn: Connection { inner },
            driver: Arc::clone(&self.driver),
            id: self.id.clone(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainHandle")
            .field("id", &self.id)
            .field("hypervisor", &self.conn.id())
            .finish()
    }
}
