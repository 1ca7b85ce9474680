//! Hypervisor identity and node capability info.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::snapshot::MemorySize;

/// Numeric identifier of a configured hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HypervisorId(pub u32);

impl fmt::Display for HypervisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical node information reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// CPU model string (e.g. `"x86_64"`).
    pub model: String,
    /// Number of active host CPUs.
    pub cpus: u32,
    /// Expected CPU frequency in MHz.
    pub mhz: u32,
    /// Number of NUMA cells.
    pub nodes: u32,
    /// CPU sockets per NUMA cell.
    pub sockets: u32,
    /// Cores per socket.
    pub cores: u32,
    /// Threads per core.
    pub threads: u32,
    pub memory: MemorySize,
}

/// Everything known about a connected hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HypervisorInfo {
    pub id: HypervisorId,
    pub name: String,
    /// Connection URI, e.g. `qemu+ssh://host/system` or `test:///default`.
    pub uri: String,
    pub hostname: String,
    /// Hypervisor version string.
    pub version: String,
    /// Client library version string.
    pub lib_version: String,
    /// Maximum vCPUs a single guest may be given.
    pub max_vcpus: u32,
    pub node_info: NodeInfo,
    pub capabilities: Vec<String>,
}
