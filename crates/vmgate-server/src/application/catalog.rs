//! The pool of configured hypervisors.
//!
//! Virtual machines are looked up across every connected host: listings
//! follow host order, then the driver's domain order, and a UUID lookup
//! returns the first match.

use tracing::{error, info, warn};
use vmgate_core::{DomainSnapshot, HypervisorId, VirtError};

use super::connection::{Connection, DomainHandle};
use super::driver::DriverConnector;
use super::snapshot;

/// One configured hypervisor: where to connect and how to label it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorEndpoint {
    pub id: HypervisorId,
    pub name: String,
    pub uri: String,
}

/// All hypervisors the gateway is connected to.
#[derive(Debug, Default)]
pub struct HypervisorPool {
    connections: Vec<Connection>,
}

impl HypervisorPool {
    /// Connects to every endpoint.  A host that fails to connect is logged
    /// and left out; the others are still served.
    pub fn connect_all(endpoints: &[HypervisorEndpoint], connector: &dyn DriverConnector) -> Self {
        let mut connections = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match Connection::open(endpoint.id, endpoint.name.clone(), &endpoint.uri, connector) {
                Ok(conn) => connections.push(conn),
                Err(err) => error!(
                    hypervisor = %endpoint.id,
                    uri = %endpoint.uri,
                    error = %err,
                    "hypervisor unavailable, skipping"
                ),
            }
        }
        info!(
            connected = connections.len(),
            configured = endpoints.len(),
            "hypervisor pool ready"
        );
        Self { connections }
    }

    pub fn from_connections(connections: Vec<Connection>) -> Self {
        Self { connections }
    }

    pub fn hypervisors(&self) -> &[Connection] {
        &self.connections
    }

    pub fn hypervisor(&self, id: HypervisorId) -> Result<&Connection, VirtError> {
        self.connections
            .iter()
            .find(|conn| conn.id() == id)
            .ok_or_else(|| VirtError::NotFound {
                resource: "hypervisor",
                id: id.to_string(),
            })
    }

    /// A fresh snapshot of every domain on every host.
    pub fn virtual_machines(&self) -> Result<Vec<DomainSnapshot>, VirtError> {
        let mut machines = Vec::new();
        for conn in &self.connections {
            for domain in conn.list_domains()? {
                machines.push(snapshot::refresh(&domain)?);
            }
        }
        Ok(machines)
    }

    /// The live handle of the domain with `uuid`, searching hosts in order.
    pub fn find_domain(&self, uuid: &str) -> Result<DomainHandle, VirtError> {
        for conn in &self.connections {
            match conn.lookup_domain(uuid) {
                Ok(domain) => return Ok(domain),
                Err(VirtError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VirtError::NotFound {
            resource: "virtual machine",
            id: uuid.to_string(),
        })
    }

    pub fn find_virtual_machine(&self, uuid: &str) -> Result<DomainSnapshot, VirtError> {
        snapshot::refresh(&self.find_domain(uuid)?)
    }

    /// Closes every connection that is still open.
    pub fn close_all(&self) {
        for conn in self.connections.iter().filter(|conn| conn.is_open()) {
            if let Err(err) = conn.close() {
                warn!(hypervisor = %conn.id(), error = %err, "closing hypervisor failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::connector::UriConnector;

    fn endpoint(id: u32, uri: &str) -> HypervisorEndpoint {
        HypervisorEndpoint {
            id: HypervisorId(id),
            name: format!("host-{id}"),
            uri: uri.to_string(),
        }
    }

    #[test]
    fn test_unreachable_host_is_omitted() {
        // Arrange
        let endpoints = [
            endpoint(1, "test:///default"),
            endpoint(2, "qemu+ssh://nowhere/system"),
        ];

        // Act
        let pool = HypervisorPool::connect_all(&endpoints, &UriConnector);

        // Assert
        assert_eq!(pool.hypervisors().len(), 1);
        assert_eq!(pool.hypervisors()[0].id(), HypervisorId(1));
    }

    #[test]
    fn test_virtual_machines_follow_host_order() {
        let endpoints = [endpoint(1, "test:///default"), endpoint(2, "test:///default")];
        let pool = HypervisorPool::connect_all(&endpoints, &UriConnector);

        let machines = pool.virtual_machines().unwrap();

        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].hypervisor_id, HypervisorId(1));
        assert_eq!(machines[1].hypervisor_id, HypervisorId(2));
    }

    #[test]
    fn test_unknown_hypervisor_is_not_found() {
        let pool = HypervisorPool::connect_all(&[endpoint(1, "test:///empty")], &UriConnector);

        let err = pool.hypervisor(HypervisorId(9)).unwrap_err();

        assert_eq!(err.to_string(), "hypervisor 9 not found");
    }

    #[test]
    fn test_find_virtual_machine_searches_every_host() {
        let endpoints = [endpoint(1, "test:///empty"), endpoint(2, "test:///default")];
        let pool = HypervisorPool::connect_all(&endpoints, &UriConnector);

        let vm = pool
            .find_virtual_machine(crate::infrastructure::test_driver::DEFAULT_DOMAIN_UUID)
            .unwrap();

        assert_eq!(vm.name, "test");
        assert_eq!(vm.hypervisor_id, HypervisorId(2));
        assert!(matches!(
            pool.find_virtual_machine("missing"),
            Err(VirtError::NotFound { .. })
        ));
    }

    #[test]
    fn test_close_all_closes_each_connection_once() {
        let pool = HypervisorPool::connect_all(&[endpoint(1, "test:///default")], &UriConnector);

        pool.close_all();
        pool.close_all();

        assert!(!pool.hypervisors()[0].is_open());
    }
}
