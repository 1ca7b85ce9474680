//! Read-only hypervisor and virtual-machine endpoints.
//!
//! HTTP routing lives outside this crate.  The router resolves a request to
//! a [`Route`] and [`dispatch`] answers with a status, headers and a JSON
//! body:
//!
//! ```text
//! GET /hypervisors            → Route { Hypervisors,     Index }
//! GET /hypervisors/1          → Route { Hypervisors,     Show("1") }
//! GET /virtual-machines       → Route { VirtualMachines, Index }
//! GET /virtual-machines/<id>  → Route { VirtualMachines, Show(<id>) }
//! ```
//!
//! Success bodies are `{"data": ...}`; failures are
//! `{"error": {"kind": ..., "message": ...}}` where the message never carries
//! the native hypervisor diagnostic (that goes to the log).

use std::str::FromStr;

use serde_json::{json, Value};
use tracing::warn;
use vmgate_core::{
    DomainSnapshot, ErrorKind, HypervisorId, HypervisorInfo, VirtError, VirtualMachineView,
};

use super::catalog::HypervisorPool;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    Hypervisors,
    VirtualMachines,
}

impl FromStr for Controller {
    type Err = VirtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hypervisors" => Ok(Controller::Hypervisors),
            "virtual-machines" | "virtual_machines" => Ok(Controller::VirtualMachines),
            other => Err(VirtError::NotFound {
                resource: "route",
                id: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Index,
    Show(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub controller: Controller,
    pub action: Action,
}

impl Route {
    pub fn index(controller: Controller) -> Self {
        Self {
            controller,
            action: Action::Index,
        }
    }

    pub fn show(controller: Controller, id: impl Into<String>) -> Self {
        Self {
            controller,
            action: Action::Show(id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

impl ApiResponse {
    fn ok(data: Value) -> Self {
        Self::json(200, json!({ "data": data }))
    }

    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type", CONTENT_TYPE_JSON.to_string())],
            body,
        }
    }
}

/// Answers a resolved route.  Blocks on hypervisor reads.
pub fn dispatch(pool: &HypervisorPool, route: &Route) -> ApiResponse {
    let result = match (&route.controller, &route.action) {
        (Controller::Hypervisors, Action::Index) => pool
            .hypervisors()
            .iter()
            .map(|conn| conn.info().map(|info| hypervisor_view(&info)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (Controller::Hypervisors, Action::Show(id)) => parse_hypervisor_id(id)
            .and_then(|id| pool.hypervisor(id))
            .and_then(|conn| conn.info())
            .map(|info| hypervisor_view(&info)),
        (Controller::VirtualMachines, Action::Index) => pool
            .virtual_machines()
            .map(|machines| Value::Array(machines.iter().map(virtual_machine_view).collect())),
        (Controller::VirtualMachines, Action::Show(id)) => pool
            .find_virtual_machine(id)
            .map(|machine| virtual_machine_view(&machine)),
    };

    match result {
        Ok(data) => ApiResponse::ok(data),
        Err(err) => error_response(&err),
    }
}

/// Structured error response; the full error is logged.
pub fn error_response(err: &VirtError) -> ApiResponse {
    let api = err.to_api_error();
    if api.kind != ErrorKind::NotFound {
        warn!(error = %err, kind = ?api.kind, "request failed");
    }
    ApiResponse::json(
        status_for(api.kind),
        json!({ "error": { "kind": api.kind, "message": api.message } }),
    )
}

pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::InvalidCommand => 422,
        ErrorKind::InvalidState => 409,
        ErrorKind::HypervisorOperation => 502,
        ErrorKind::Connection => 503,
        ErrorKind::Stream => 500,
    }
}

fn parse_hypervisor_id(raw: &str) -> Result<HypervisorId, VirtError> {
    raw.parse::<u32>()
        .map(HypervisorId)
        .map_err(|_| VirtError::NotFound {
            resource: "hypervisor",
            id: raw.to_string(),
        })
}

pub fn hypervisor_view(info: &HypervisorInfo) -> Value {
    let node = &info.node_info;
    json!({
        "id": info.id,
        "name": info.name,
        "uri": info.uri,
        "hostname": info.hostname,
        "version": info.version,
        "lib_version": info.lib_version,
        "max_vcpus": info.max_vcpus,
        "node_info": {
            "model": node.model,
            "cpus": node.cpus,
            "mhz": node.mhz,
            "nodes": node.nodes,
            "sockets": node.sockets,
            "cores": node.cores,
            "threads": node.threads,
            "memory": node.memory.to_string(),
        },
        "capabilities": info.capabilities,
    })
}

/// The same shape cable clients receive in `VirtualMachineUpdated`.
pub fn virtual_machine_view(machine: &DomainSnapshot) -> Value {
    json!(VirtualMachineView::from(machine))
}
