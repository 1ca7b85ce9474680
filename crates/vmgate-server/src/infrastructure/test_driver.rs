//! In-memory hypervisor driver for `test://` connection URIs.
//!
//! # Why an in-memory driver? (for beginners)
//!
//! Real hypervisors need root, a kernel module and minutes to boot a guest.
//! This driver keeps every domain as a small state machine in memory so the
//! gateway can run on a laptop and every application use case can be tested
//! deterministically.
//!
//! It behaves like a real host where it matters:
//!
//! - lifecycle calls move the domain between power states and reject calls
//!   that do not fit the current state with the native
//!   "Requested operation is not valid" message;
//! - every state change emits the matching lifecycle event to registered
//!   sinks, numbered with a per-connection sequence;
//! - screenshots are written into the stream by a separate thread, in chunks,
//!   the way a hypervisor writes from its own I/O loop.
//!
//! Beyond that it records every call and lets tests inject failures by
//! operation name (`fail_on("start", "...")`).
//!
//! # URIs
//!
//! | URI               | Host contents                                   |
//! |-------------------|-------------------------------------------------|
//! | `test:///default` | one running domain named `test` with a display |
//! | `test:///empty`   | no domains                                      |

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tracing::debug;
use uuid::Uuid;
use vmgate_core::{
    DomainAction, DomainEvent, DomainState, EventKind, EventPayload, LifecycleEvent, MemorySize,
    NodeInfo, PowerState,
};

use crate::application::driver::{
    CallbackId, DomainDriver, DriverError, EventSink, HostInfo, HypervisorDriver, StreamCallback,
    StreamDriver, StreamEvents, StreamRecv,
};
use crate::application::lock;

/// UUID of the `test` domain on `test:///default`.
pub const DEFAULT_DOMAIN_UUID: &str = "6695eb01-f6a4-8304-79aa-97f2502e193f";

/// MIME type of the framebuffer images this driver writes.
pub const SCREENSHOT_MIME: &str = "image/x-portable-pixmap";

/// Bytes written into a stream per producer write.
const FRAME_CHUNK: usize = 16;

// Native reason codes attached to power states.
const RUNNING_BOOTED: i32 = 1;
const RUNNING_UNPAUSED: i32 = 5;
const PAUSED_USER: i32 = 1;
const PAUSED_RESTORED: i32 = 3;
const SHUTOFF_SHUTDOWN: i32 = 1;
const SHUTOFF_DESTROYED: i32 = 2;
const SHUTOFF_SAVED: i32 = 5;

// Native detail codes attached to lifecycle events.
const STARTED_BOOTED: i32 = 0;
const STARTED_RESTORED: i32 = 2;
const STOPPED_SHUTDOWN: i32 = 0;
const STOPPED_DESTROYED: i32 = 1;
const STOPPED_SAVED: i32 = 4;

// ── TestHypervisor ────────────────────────────────────────────────────────────

/// One emulated host.  Clones share the same host.
#[derive(Clone)]
pub struct TestHypervisor {
    host: Arc<HostState>,
}

struct HostState {
    info: HostInfo,
    domains: Mutex<Vec<Arc<TestDomain>>>,
    registrations: Mutex<Vec<Registration>>,
    streams: Mutex<Vec<Arc<TestStream>>>,
    failures: Mutex<HashMap<String, String>>,
    emit_lock: Mutex<()>,
    next_callback: AtomicU64,
    next_sequence: AtomicU64,
    closed: AtomicBool,
}

struct Registration {
    id: CallbackId,
    kind: EventKind,
    domain_id: String,
    sink: EventSink,
}

impl TestHypervisor {
    /// A host without domains.
    pub fn new() -> Self {
        Self {
            host: Arc::new(HostState {
                info: default_host_info(),
                domains: Mutex::new(Vec::new()),
                registrations: Mutex::new(Vec::new()),
                streams: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                emit_lock: Mutex::new(()),
                next_callback: AtomicU64::new(0),
                next_sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The `test:///default` host: one running domain named `test`.
    pub fn with_default_domain() -> Self {
        let hypervisor = Self::new();
        hypervisor.add_domain(
            TestDomainConfig::new("test")
                .with_uuid(DEFAULT_DOMAIN_UUID)
                .with_state(DomainState::Running, RUNNING_BOOTED)
                .with_vcpus(2)
                .with_memory(MemorySize::from_mib(8))
                .with_framebuffer(default_framebuffer()),
        );
        hypervisor
    }

    /// Opens the host named by a `test://` URI.
    pub fn from_uri(uri: &str) -> Result<Self, DriverError> {
        let path = uri
            .strip_prefix("test://")
            .ok_or_else(|| DriverError::Operation(format!("not a test driver URI: {uri}")))?;
        match path {
            "/default" => Ok(Self::with_default_domain()),
            "/empty" => Ok(Self::new()),
            other => Err(DriverError::Operation(format!(
                "cannot open test driver file {other}"
            ))),
        }
    }

    pub fn add_domain(&self, config: TestDomainConfig) -> Arc<TestDomain> {
        let domain = Arc::new(TestDomain::new(config, Arc::downgrade(&self.host)));
        lock(&self.host.domains).push(Arc::clone(&domain));
        domain
    }

    pub fn domain(&self, uuid: &str) -> Option<Arc<TestDomain>> {
        lock(&self.host.domains)
            .iter()
            .find(|domain| domain.uuid == uuid)
            .cloned()
    }

    pub fn domain_by_name(&self, name: &str) -> Option<Arc<TestDomain>> {
        lock(&self.host.domains)
            .iter()
            .find(|domain| domain.name == name)
            .cloned()
    }

    /// Emits an event for `domain_id` on the calling thread.  Returns its
    /// sequence number.
    pub fn emit(&self, domain_id: &str, payload: EventPayload) -> u64 {
        self.host.emit(domain_id, payload)
    }

    pub fn registration_count(&self) -> usize {
        lock(&self.host.registrations).len()
    }

    pub fn last_stream(&self) -> Option<Arc<TestStream>> {
        lock(&self.host.streams).last().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.host.closed.load(Ordering::SeqCst)
    }

    /// Makes every later host-level call named `operation` fail with `message`.
    pub fn fail_on(&self, operation: &str, message: &str) {
        lock(&self.host.failures).insert(operation.to_string(), message.to_string());
    }
}

impl Default for TestHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostState {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::ConnectionLost("connection closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn injected(&self, operation: &str) -> Result<(), DriverError> {
        match lock(&self.failures).get(operation) {
            Some(message) => Err(DriverError::Operation(message.clone())),
            None => Ok(()),
        }
    }

    fn emit(&self, domain_id: &str, payload: EventPayload) -> u64 {
        // Serialised so sinks observe events in sequence order.
        let _guard = lock(&self.emit_lock);
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = DomainEvent {
            domain_id: domain_id.to_string(),
            sequence,
            payload,
        };
        let kind = event.kind();
        let sinks: Vec<EventSink> = lock(&self.registrations)
            .iter()
            .filter(|r| r.kind == kind && r.domain_id == domain_id)
            .map(|r| Arc::clone(&r.sink))
            .collect();
        debug!(
            domain = %domain_id,
            sequence,
            kind = kind.as_str(),
            sinks = sinks.len(),
            "emitting event"
        );
        for sink in sinks {
            sink(event.clone());
        }
        sequence
    }

    fn find_stream(&self, stream: &Arc<dyn StreamDriver>) -> Option<Arc<TestStream>> {
        let wanted = Arc::as_ptr(stream) as *const u8;
        lock(&self.streams)
            .iter()
            .find(|candidate| Arc::as_ptr(*candidate) as *const u8 == wanted)
            .cloned()
    }
}

impl HypervisorDriver for TestHypervisor {
    fn host_info(&self) -> Result<HostInfo, DriverError> {
        self.host.check_open()?;
        self.host.injected("host_info")?;
        Ok(self.host.info.clone())
    }

    fn list_all_domains(&self) -> Result<Vec<Arc<dyn DomainDriver>>, DriverError> {
        self.host.check_open()?;
        self.host.injected("list_all_domains")?;
        Ok(lock(&self.host.domains)
            .iter()
            .map(|domain| Arc::clone(domain) as Arc<dyn DomainDriver>)
            .collect())
    }

    fn create_stream(&self) -> Result<Arc<dyn StreamDriver>, DriverError> {
        self.host.check_open()?;
        self.host.injected("create_stream")?;
        let stream = Arc::new(TestStream::new());
        lock(&self.host.streams).push(Arc::clone(&stream));
        Ok(stream)
    }

    fn domain_event_register_any(
        &self,
        kind: EventKind,
        domain_id: &str,
        sink: EventSink,
    ) -> Result<CallbackId, DriverError> {
        self.host.check_open()?;
        self.host.injected("domain_event_register_any")?;
        let id = CallbackId(self.host.next_callback.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.host.registrations).push(Registration {
            id,
            kind,
            domain_id: domain_id.to_string(),
            sink,
        });
        Ok(id)
    }

    fn domain_event_deregister_any(&self, id: CallbackId) -> Result<(), DriverError> {
        let mut registrations = lock(&self.host.registrations);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        if registrations.len() == before {
            return Err(DriverError::Operation(format!(
                "callback {} is not registered",
                id.0
            )));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), DriverError> {
        if self.host.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Operation("connection already closed".to_string()));
        }
        lock(&self.host.registrations).clear();
        Ok(())
    }
}

fn default_host_info() -> HostInfo {
    HostInfo {
        hostname: "test".to_string(),
        version: "2.0.0".to_string(),
        lib_version: "2.0.0".to_string(),
        max_vcpus: 4,
        node_info: NodeInfo {
            model: "Test".to_string(),
            cpus: 2,
            mhz: 3600,
            nodes: 1,
            sockets: 1,
            cores: 2,
            threads: 1,
            memory: MemorySize::from_mib(4096),
        },
        capabilities: vec!["hvm".to_string()],
    }
}

/// A 4×4 binary PPM image.
fn default_framebuffer() -> Vec<u8> {
    let mut image = b"P6\n4 4\n255\n".to_vec();
    for pixel in 0..16u8 {
        image.extend_from_slice(&[pixel * 16, 0x40, 0xff - pixel * 16]);
    }
    image
}

// ── TestDomain ────────────────────────────────────────────────────────────────

/// Initial settings of an emulated domain.
#[derive(Debug, Clone)]
pub struct TestDomainConfig {
    pub uuid: String,
    pub name: String,
    pub state: DomainState,
    pub reason: i32,
    pub vcpus: u32,
    pub memory: MemorySize,
    /// Image written on screenshot; `None` leaves the stream to the test.
    pub framebuffer: Option<Vec<u8>>,
}

impl TestDomainConfig {
    /// A shut-off domain with a random UUID, 1 vCPU and 512 MiB.
    pub fn new(name: &str) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            state: DomainState::Shutoff,
            reason: SHUTOFF_SHUTDOWN,
            vcpus: 1,
            memory: MemorySize::from_mib(512),
            framebuffer: None,
        }
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = uuid.to_string();
        self
    }

    pub fn with_state(mut self, state: DomainState, reason: i32) -> Self {
        self.state = state;
        self.reason = reason;
        self
    }

    pub fn running(self) -> Self {
        self.with_state(DomainState::Running, RUNNING_BOOTED)
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_memory(mut self, memory: MemorySize) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_framebuffer(mut self, image: Vec<u8>) -> Self {
        self.framebuffer = Some(image);
        self
    }
}

/// One emulated domain.
pub struct TestDomain {
    uuid: String,
    name: String,
    vcpus: u32,
    memory: MemorySize,
    framebuffer: Option<Vec<u8>>,
    power: Mutex<PowerState>,
    saved_image: AtomicBool,
    actions: Mutex<Vec<DomainAction>>,
    queries: Mutex<Vec<&'static str>>,
    failures: Mutex<HashMap<String, String>>,
    host: Weak<HostState>,
}

/// Outcome of applying one action to the emulated state.
struct Applied {
    next: Option<PowerState>,
    events: Vec<EventPayload>,
}

impl TestDomain {
    fn new(config: TestDomainConfig, host: Weak<HostState>) -> Self {
        Self {
            uuid: config.uuid,
            name: config.name,
            vcpus: config.vcpus,
            memory: config.memory,
            framebuffer: config.framebuffer,
            power: Mutex::new(PowerState::new(config.state, config.reason)),
            saved_image: AtomicBool::new(false),
            actions: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            host,
        }
    }

    pub fn id(&self) -> &str {
        &self.uuid
    }

    pub fn power_state(&self) -> PowerState {
        *lock(&self.power)
    }

    pub fn has_saved_image(&self) -> bool {
        self.saved_image.load(Ordering::SeqCst)
    }

    /// Lifecycle calls received, in order.
    pub fn actions(&self) -> Vec<DomainAction> {
        lock(&self.actions).clone()
    }

    /// Read calls received, in order (`"uuid"`, `"max_vcpus"`, ...).
    pub fn queries(&self) -> Vec<&'static str> {
        lock(&self.queries).clone()
    }

    /// Makes every later call named `operation` fail with `message`.
    ///
    /// Names are the driver method names: `"start"`, `"shutdown"`,
    /// `"max_vcpus"`, `"screenshot"`, ...
    pub fn fail_on(&self, operation: &str, message: &str) {
        lock(&self.failures).insert(operation.to_string(), message.to_string());
    }

    fn host(&self) -> Result<Arc<HostState>, DriverError> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| DriverError::ConnectionLost("connection closed".to_string()))?;
        host.check_open()?;
        Ok(host)
    }

    fn injected(&self, operation: &str) -> Result<(), DriverError> {
        match lock(&self.failures).get(operation) {
            Some(message) => Err(DriverError::Operation(message.clone())),
            None => Ok(()),
        }
    }

    fn query<T>(
        &self,
        operation: &'static str,
        read: impl FnOnce() -> T,
    ) -> Result<T, DriverError> {
        self.host()?;
        lock(&self.queries).push(operation);
        self.injected(operation)?;
        Ok(read())
    }

    fn act(&self, action: DomainAction) -> Result<(), DriverError> {
        let host = self.host()?;
        lock(&self.actions).push(action);
        self.injected(action.name())?;

        let applied = {
            let mut power = lock(&self.power);
            let applied = self.apply(action, power.state)?;
            if let Some(next) = applied.next {
                *power = next;
            }
            applied
        };
        for payload in applied.events {
            host.emit(&self.uuid, payload);
        }
        Ok(())
    }

    fn apply(&self, action: DomainAction, current: DomainState) -> Result<Applied, DriverError> {
        use DomainState::*;

        let active = matches!(current, Running | Blocked | Paused | PmSuspended | Shutdown);
        let running = matches!(current, Running | Blocked);
        let not_running = || DriverError::operation_invalid("domain is not running");

        let applied = match action {
            DomainAction::Start if active => {
                return Err(DriverError::operation_invalid("domain is already running"))
            }
            DomainAction::Start if self.has_saved_image() => {
                self.saved_image.store(false, Ordering::SeqCst);
                Applied {
                    next: Some(PowerState::new(Paused, PAUSED_RESTORED)),
                    events: vec![
                        lifecycle(LifecycleEvent::Started, STARTED_RESTORED),
                        lifecycle(LifecycleEvent::Suspended, 0),
                    ],
                }
            }
            DomainAction::Start => Applied {
                next: Some(PowerState::new(Running, RUNNING_BOOTED)),
                events: vec![lifecycle(LifecycleEvent::Started, STARTED_BOOTED)],
            },
            DomainAction::Shutdown { .. } if running => Applied {
                next: Some(PowerState::new(Shutoff, SHUTOFF_SHUTDOWN)),
                events: vec![
                    lifecycle(LifecycleEvent::Shutdown, 0),
                    lifecycle(LifecycleEvent::Stopped, STOPPED_SHUTDOWN),
                ],
            },
            DomainAction::PowerOff if active => Applied {
                next: Some(PowerState::new(Shutoff, SHUTOFF_DESTROYED)),
                events: vec![lifecycle(LifecycleEvent::Stopped, STOPPED_DESTROYED)],
            },
            DomainAction::Suspend if running => Applied {
                next: Some(PowerState::new(Paused, PAUSED_USER)),
                events: vec![lifecycle(LifecycleEvent::Suspended, 0)],
            },
            DomainAction::Resume if current == Paused => Applied {
                next: Some(PowerState::new(Running, RUNNING_UNPAUSED)),
                events: vec![lifecycle(LifecycleEvent::Resumed, 0)],
            },
            DomainAction::Resume => {
                return Err(DriverError::operation_invalid("domain is not paused"))
            }
            DomainAction::Reboot if running => Applied {
                next: None,
                events: vec![EventPayload::Reboot],
            },
            DomainAction::Reset if running || current == Paused => Applied {
                next: None,
                events: Vec::new(),
            },
            DomainAction::SaveMemory if running || current == Paused => {
                self.saved_image.store(true, Ordering::SeqCst);
                Applied {
                    next: Some(PowerState::new(Shutoff, SHUTOFF_SAVED)),
                    events: vec![lifecycle(LifecycleEvent::Stopped, STOPPED_SAVED)],
                }
            }
            _ => return Err(not_running()),
        };
        Ok(applied)
    }

    fn xml(&self) -> String {
        format!(
            "<domain type='test'>\n  <name>{}</name>\n  <uuid>{}</uuid>\n  \
             <memory unit='KiB'>{}</memory>\n  <vcpu>{}</vcpu>\n</domain>",
            self.name,
            self.uuid,
            self.memory.kib(),
            self.vcpus
        )
    }
}

fn lifecycle(event: LifecycleEvent, detail: i32) -> EventPayload {
    EventPayload::Lifecycle { event, detail }
}

impl DomainDriver for TestDomain {
    fn uuid(&self) -> Result<String, DriverError> {
        self.query("uuid", || self.uuid.clone())
    }

    fn name(&self) -> Result<String, DriverError> {
        self.query("name", || self.name.clone())
    }

    fn state(&self) -> Result<(i32, i32), DriverError> {
        self.query("state", || {
            let power = self.power_state();
            (power.state.code(), power.reason)
        })
    }

    fn max_vcpus(&self) -> Result<u32, DriverError> {
        self.query("max_vcpus", || self.vcpus)
    }

    fn max_memory(&self) -> Result<u64, DriverError> {
        self.query("max_memory", || self.memory.kib())
    }

    fn xml_desc(&self) -> Result<String, DriverError> {
        self.query("xml_desc", || self.xml())
    }

    fn start(&self) -> Result<(), DriverError> {
        self.act(DomainAction::Start)
    }

    fn shutdown(&self, grace: u32) -> Result<(), DriverError> {
        self.act(DomainAction::Shutdown { grace })
    }

    fn power_off(&self) -> Result<(), DriverError> {
        self.act(DomainAction::PowerOff)
    }

    fn suspend(&self) -> Result<(), DriverError> {
        self.act(DomainAction::Suspend)
    }

    fn resume(&self) -> Result<(), DriverError> {
        self.act(DomainAction::Resume)
    }

    fn reboot(&self) -> Result<(), DriverError> {
        self.act(DomainAction::Reboot)
    }

    fn reset(&self) -> Result<(), DriverError> {
        self.act(DomainAction::Reset)
    }

    fn save_memory(&self) -> Result<(), DriverError> {
        self.act(DomainAction::SaveMemory)
    }

    fn screenshot(
        &self,
        stream: Arc<dyn StreamDriver>,
        display: u32,
    ) -> Result<String, DriverError> {
        let host = self.host()?;
        lock(&self.queries).push("screenshot");
        self.injected("screenshot")?;

        let state = self.power_state().state;
        if !matches!(state, DomainState::Running | DomainState::Blocked | DomainState::Paused) {
            return Err(DriverError::operation_invalid("domain is not running"));
        }
        let target = host.find_stream(&stream).ok_or_else(|| {
            DriverError::Operation("stream does not belong to this connection".to_string())
        })?;
        *lock(&target.display) = Some(display);

        if let Some(image) = self.framebuffer.clone() {
            let writer = Arc::clone(&target);
            thread::Builder::new()
                .name("test-framebuffer".to_string())
                .spawn(move || {
                    for chunk in image.chunks(FRAME_CHUNK) {
                        writer.push(chunk);
                    }
                    writer.close_writer();
                })
                .map_err(|err| DriverError::Operation(err.to_string()))?;
        }
        Ok(SCREENSHOT_MIME.to_string())
    }
}

// ── TestStream ────────────────────────────────────────────────────────────────

/// An emulated stream.  The producer side (`push`, `close_writer`,
/// `inject_error`) is driven by the domain or by tests.
pub struct TestStream {
    buffer: Mutex<StreamBuffer>,
    slot: Mutex<CallbackSlot>,
    display: Mutex<Option<u32>>,
}

#[derive(Default)]
struct StreamBuffer {
    data: VecDeque<u8>,
    eof: bool,
    error: Option<String>,
    aborted: bool,
    finished: bool,
}

#[derive(Default)]
struct CallbackSlot {
    /// `None` while the callback is running or after removal.
    callback: Option<StreamCallback>,
    registered: bool,
    interest: StreamEvents,
    /// Bumped on every add/remove; a running callback whose generation is
    /// stale is dropped instead of put back.
    generation: u64,
    /// Readiness that arrived while the callback was running.
    pending: StreamEvents,
}

impl TestStream {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(StreamBuffer::default()),
            slot: Mutex::new(CallbackSlot::default()),
            display: Mutex::new(None),
        }
    }

    /// Producer write.  Discarded once the stream is aborted or closed.
    pub fn push(&self, bytes: &[u8]) {
        {
            let mut buffer = lock(&self.buffer);
            if buffer.aborted || buffer.eof {
                return;
            }
            buffer.data.extend(bytes.iter().copied());
        }
        self.notify(StreamEvents::READABLE);
    }

    /// Producer end-of-stream.
    pub fn close_writer(&self) {
        {
            let mut buffer = lock(&self.buffer);
            if buffer.aborted {
                return;
            }
            buffer.eof = true;
        }
        self.notify(StreamEvents::READABLE);
    }

    /// Makes the next read fail and reports an error event.
    pub fn inject_error(&self, message: &str) {
        lock(&self.buffer).error = Some(message.to_string());
        self.notify(StreamEvents::ERROR);
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.buffer).aborted
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.buffer).finished
    }

    pub fn buffered_len(&self) -> usize {
        lock(&self.buffer).data.len()
    }

    pub fn has_callback(&self) -> bool {
        lock(&self.slot).registered
    }

    /// Display the hypervisor was asked to capture.
    pub fn display(&self) -> Option<u32> {
        *lock(&self.display)
    }

    fn ready_events(&self) -> StreamEvents {
        let buffer = lock(&self.buffer);
        if buffer.error.is_some() {
            StreamEvents::ERROR
        } else if !buffer.data.is_empty() || buffer.eof {
            StreamEvents::READABLE
        } else {
            StreamEvents::default()
        }
    }

    /// Runs the callback outside the slot lock so it may call back into the
    /// stream, including `event_remove_callback`.
    fn notify(&self, events: StreamEvents) {
        let mut events = events;
        loop {
            let (mut callback, generation) = {
                let mut slot = lock(&self.slot);
                let always = StreamEvents::ERROR.union(StreamEvents::HANGUP);
                if !slot.interest.union(always).intersects(events) {
                    return;
                }
                match slot.callback.take() {
                    Some(callback) => (callback, slot.generation),
                    None => {
                        if slot.registered {
                            slot.pending = slot.pending.union(events);
                        }
                        return;
                    }
                }
            };

            callback(events);

            let mut slot = lock(&self.slot);
            if slot.generation != generation {
                return;
            }
            slot.callback = Some(callback);
            events = std::mem::take(&mut slot.pending);
            if events.is_empty() {
                return;
            }
        }
    }
}

impl StreamDriver for TestStream {
    fn event_add_callback(
        &self,
        events: StreamEvents,
        callback: StreamCallback,
    ) -> Result<(), DriverError> {
        {
            let mut slot = lock(&self.slot);
            if slot.registered {
                return Err(DriverError::Operation(
                    "stream already has a callback".to_string(),
                ));
            }
            slot.callback = Some(callback);
            slot.registered = true;
            slot.interest = events;
            slot.generation += 1;
            slot.pending = StreamEvents::default();
        }
        let ready = self.ready_events();
        if !ready.is_empty() {
            self.notify(ready);
        }
        Ok(())
    }

    fn event_remove_callback(&self) -> Result<(), DriverError> {
        let mut slot = lock(&self.slot);
        if !slot.registered {
            return Err(DriverError::Operation("stream has no callback".to_string()));
        }
        slot.callback = None;
        slot.registered = false;
        slot.generation += 1;
        slot.pending = StreamEvents::default();
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<StreamRecv, DriverError> {
        let mut buffer = lock(&self.buffer);
        if buffer.aborted {
            return Err(DriverError::Operation("stream aborted".to_string()));
        }
        if let Some(message) = &buffer.error {
            return Err(DriverError::Operation(message.clone()));
        }
        if !buffer.data.is_empty() {
            let n = buf.len().min(buffer.data.len());
            for (slot, byte) in buf.iter_mut().zip(buffer.data.drain(..n)) {
                *slot = byte;
            }
            return Ok(StreamRecv::Data(n));
        }
        Ok(if buffer.eof {
            StreamRecv::Eof
        } else {
            StreamRecv::WouldBlock
        })
    }

    fn finish(&self) -> Result<(), DriverError> {
        let mut buffer = lock(&self.buffer);
        if buffer.aborted {
            return Err(DriverError::Operation("stream aborted".to_string()));
        }
        buffer.finished = true;
        Ok(())
    }

    fn abort(&self) -> Result<(), DriverError> {
        let mut buffer = lock(&self.buffer);
        buffer.aborted = true;
        buffer.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_default_uri_has_running_test_domain() {
        // Arrange / Act
        let hypervisor = TestHypervisor::from_uri("test:///default").unwrap();

        // Assert
        let domain = hypervisor.domain_by_name("test").unwrap();
        assert_eq!(domain.id(), DEFAULT_DOMAIN_UUID);
        assert_eq!(domain.power_state().state, DomainState::Running);
    }

    #[test]
    fn test_unknown_test_path_is_rejected() {
        assert!(TestHypervisor::from_uri("test:///nowhere.xml").is_err());
        assert!(TestHypervisor::from_uri("qemu:///system").is_err());
    }

    #[test]
    fn test_start_running_domain_is_operation_invalid() {
        let hypervisor = TestHypervisor::with_default_domain();
        let domain = hypervisor.domain(DEFAULT_DOMAIN_UUID).unwrap();

        let err = domain.start().unwrap_err();

        assert_eq!(
            err,
            DriverError::operation_invalid("domain is already running")
        );
    }

    #[test]
    fn test_save_then_start_restores_paused() {
        // Arrange
        let hypervisor = TestHypervisor::with_default_domain();
        let domain = hypervisor.domain(DEFAULT_DOMAIN_UUID).unwrap();

        // Act
        domain.save_memory().unwrap();
        let saved = domain.power_state();
        domain.start().unwrap();

        // Assert
        assert_eq!(saved.state, DomainState::Shutoff);
        assert_eq!(domain.power_state().state, DomainState::Paused);
        assert!(!domain.has_saved_image());
    }

    #[test]
    fn test_actions_emit_sequenced_lifecycle_events() {
        // Arrange
        let hypervisor = TestHypervisor::with_default_domain();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        hypervisor
            .domain_event_register_any(
                EventKind::Lifecycle,
                DEFAULT_DOMAIN_UUID,
                Arc::new(move |event| {
                    let _ = lock(&tx).send(event);
                }),
            )
            .unwrap();
        let domain = hypervisor.domain(DEFAULT_DOMAIN_UUID).unwrap();

        // Act
        domain.shutdown(1).unwrap();

        // Assert
        let first: DomainEvent = rx.try_recv().unwrap();
        let second: DomainEvent = rx.try_recv().unwrap();
        assert_eq!(
            first.payload,
            EventPayload::Lifecycle {
                event: LifecycleEvent::Shutdown,
                detail: 0
            }
        );
        assert!(second.sequence > first.sequence);
    }

    #[test]
    fn test_other_domains_events_are_not_delivered() {
        let hypervisor = TestHypervisor::with_default_domain();
        let (tx, rx) = mpsc::channel::<DomainEvent>();
        let tx = Mutex::new(tx);
        hypervisor
            .domain_event_register_any(
                EventKind::Reboot,
                "other",
                Arc::new(move |event| {
                    let _ = lock(&tx).send(event);
                }),
            )
            .unwrap();

        hypervisor.emit(DEFAULT_DOMAIN_UUID, EventPayload::Reboot);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_callback_fires_for_data_buffered_before_registration() {
        // Arrange
        let stream = TestStream::new();
        stream.push(b"abc");
        let (tx, rx) = mpsc::channel();

        // Act
        stream
            .event_add_callback(
                StreamEvents::READABLE,
                Box::new(move |events| {
                    let _ = tx.send(events);
                }),
            )
            .unwrap();

        // Assert
        assert_eq!(rx.try_recv().unwrap(), StreamEvents::READABLE);
    }

    #[test]
    fn test_callback_may_remove_itself() {
        let stream = Arc::new(TestStream::new());
        let inner = Arc::clone(&stream);
        stream
            .event_add_callback(
                StreamEvents::READABLE,
                Box::new(move |_| {
                    inner.event_remove_callback().unwrap();
                }),
            )
            .unwrap();

        stream.push(b"x");

        assert!(!stream.has_callback());
    }

    #[test]
    fn test_abort_discards_buffered_and_later_bytes() {
        let stream = TestStream::new();
        stream.push(b"abc");

        stream.abort().unwrap();
        stream.push(b"def");

        assert_eq!(stream.buffered_len(), 0);
        assert!(stream.is_aborted());
    }

    #[test]
    fn test_closed_host_reports_connection_lost() {
        let hypervisor = TestHypervisor::with_default_domain();
        let domain = hypervisor.domain(DEFAULT_DOMAIN_UUID).unwrap();

        hypervisor.close().unwrap();

        assert!(matches!(domain.uuid(), Err(DriverError::ConnectionLost(_))));
        assert!(hypervisor.close().is_err());
    }
}
