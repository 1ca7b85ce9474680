//! The read-only projection of a hypervisor domain.
//!
//! A [`DomainSnapshot`] is filled from the live domain handle in a single
//! round of reads and never patched afterwards.  To observe a state change
//! (e.g. after a transition), take a new snapshot.

use std::fmt;

use serde::{Serialize, Serializer};

use super::hypervisor::HypervisorId;
use super::state::{DomainState, PowerState};

/// A memory size in KiB, the unit hypervisors report domain memory in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemorySize(pub u64);

impl MemorySize {
    pub fn from_kib(kib: u64) -> Self {
        Self(kib)
    }

    pub fn from_mib(mib: u64) -> Self {
        Self(mib * 1024)
    }

    pub fn kib(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemorySize {
    /// Renders in the largest binary unit that divides the size exactly.
    ///
    /// `524288` KiB renders as `512MB`, `1536` KiB as `1536KB`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
        let mut value = self.0;
        let mut unit = 0;
        while value != 0 && value % 1024 == 0 && unit + 1 < UNITS.len() {
            value /= 1024;
            unit += 1;
        }
        write!(f, "{value}{}", UNITS[unit])
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A point-in-time view of one domain ("virtual machine" at the API boundary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSnapshot {
    /// Stable domain UUID as reported by the hypervisor.
    pub id: String,
    pub name: String,
    /// vCPU count; `None` ("unknown") whenever the domain was not running at
    /// snapshot time.
    pub cpus: Option<u32>,
    pub memory: MemorySize,
    pub state: PowerState,
    /// Full XML configuration dump.
    pub xml: String,
    /// Non-owning back-reference to the hypervisor the domain lives on.
    pub hypervisor_id: HypervisorId,
}

impl DomainSnapshot {
    /// `true` iff the domain was `running` when the snapshot was taken.
    pub fn is_running(&self) -> bool {
        self.state.state == DomainState::Running
    }

    /// Free-form tags; always absent.
    pub fn tags(&self) -> Option<Vec<String>> {
        None
    }
}

/// The API form of a [`DomainSnapshot`], used by both the REST endpoints
/// and cable pushes.
///
/// `state` is the flat lower-case name (`"running"`); the native reason code
/// travels separately as `state_reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualMachineView {
    pub id: String,
    pub name: String,
    pub state: DomainState,
    pub state_reason: i32,
    pub running: bool,
    pub cpus: Option<u32>,
    pub memory: MemorySize,
    pub xml: String,
    pub tags: Option<Vec<String>>,
    pub hypervisor_id: HypervisorId,
}

impl From<&DomainSnapshot> for VirtualMachineView {
    fn from(snapshot: &DomainSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            state: snapshot.state.state,
            state_reason: snapshot.state.reason,
            running: snapshot.is_running(),
            cpus: snapshot.cpus,
            memory: snapshot.memory,
            xml: snapshot.xml.clone(),
            tags: snapshot.tags(),
            hypervisor_id: snapshot.hypervisor_id,
        }
    }
}
