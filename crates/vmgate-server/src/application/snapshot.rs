//! Building a [`DomainSnapshot`] from a live handle.

use tracing::debug;
use vmgate_core::{DomainSnapshot, MemorySize, PowerState, VirtError};

use super::connection::DomainHandle;

/// Reads every snapshot field from the hypervisor in one round.
///
/// Reads happen in a fixed order: identity, power state, vCPU count, memory,
/// XML.  The vCPU count is only queried when the domain is running; for any
/// other state it is reported as unknown and the hypervisor is not asked.
///
/// # Errors
///
/// The first failed read aborts the refresh; no partial snapshot is
/// returned.
pub fn refresh(domain: &DomainHandle) -> Result<DomainSnapshot, VirtError> {
    let driver = domain.driver()?;
    let conn = domain.connection();

    let id = driver.uuid().map_err(|err| conn.driver_error("uuid", None, err))?;
    let name = driver.name().map_err(|err| conn.driver_error("name", None, err))?;

    let (code, reason) = driver
        .state()
        .map_err(|err| conn.driver_error("get_state", None, err))?;
    let state = PowerState::from_native(code, reason);

    let cpus = if state.is_running() {
        Some(
            driver
                .max_vcpus()
                .map_err(|err| conn.driver_error("max_vcpus", None, err))?,
        )
    } else {
        None
    };

    let memory = driver
        .max_memory()
        .map_err(|err| conn.driver_error("max_memory", None, err))?;
    let xml = driver
        .xml_desc()
        .map_err(|err| conn.driver_error("xml_desc", None, err))?;

    debug!(domain = %id, state = %state, "snapshot refreshed");
    Ok(DomainSnapshot {
        id,
        name,
        cpus,
        memory: MemorySize::from_kib(memory),
        state,
        xml,
        hypervisor_id: domain.hypervisor_id(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vmgate_core::{DomainState, ErrorKind, HypervisorId};

    use super::*;
    use crate::application::connection::Connection;
    use crate::application::driver::{DriverError, MockDomainDriver};
    use crate::infrastructure::test_driver::{TestDomainConfig, TestHypervisor};

    fn connection() -> Connection {
        Connection::with_driver(
            HypervisorId(7),
            "mock",
            "test:///empty",
            Arc::new(TestHypervisor::new()),
        )
        .unwrap()
    }

    fn identity(mock: &mut MockDomainDriver) {
        mock.expect_uuid().returning(|| Ok("abc-123".to_string()));
        mock.expect_name().returning(|| Ok("test_dom".to_string()));
    }

    #[test]
    fn test_running_domain_reads_vcpus() {
        // Arrange
        let mut mock = MockDomainDriver::new();
        identity(&mut mock);
        mock.expect_state().times(1).returning(|| Ok((1, 1)));
        mock.expect_max_vcpus().times(1).returning(|| Ok(4));
        mock.expect_max_memory().times(1).returning(|| Ok(524_288));
        mock.expect_xml_desc()
            .returning(|| Ok("<domain/>".to_string()));
        let domain = DomainHandle::from_parts(connection(), Arc::new(mock), "abc-123".to_string());

        // Act
        let snapshot = refresh(&domain).unwrap();

        // Assert
        assert_eq!(snapshot.cpus, Some(4));
        assert_eq!(snapshot.memory.to_string(), "512MB");
        assert_eq!(snapshot.state, PowerState::new(DomainState::Running, 1));
        assert_eq!(snapshot.hypervisor_id, HypervisorId(7));
        assert_eq!(snapshot.xml, "<domain/>");
    }

    /// Runs `refresh` on domain `uuid` and returns the driver reads it made.
    fn refresh_queries(hypervisor: &TestHypervisor, uuid: &str) -> Vec<&'static str> {
        let conn = Connection::with_driver(
            HypervisorId(3),
            "local",
            "test:///default",
            Arc::new(hypervisor.clone()),
        )
        .unwrap();
        let domain = conn.lookup_domain(uuid).unwrap();
        let test_domain = hypervisor.domain(uuid).unwrap();
        let before = test_domain.queries().len();
        refresh(&domain).unwrap();
        test_domain.queries().split_off(before)
    }

    #[test]
    fn test_running_refresh_reads_fields_in_order() {
        // Arrange
        let hypervisor = TestHypervisor::new();
        hypervisor.add_domain(
            TestDomainConfig::new("web")
                .with_uuid("0d1c-running")
                .running()
                .with_vcpus(2),
        );

        // Act
        let queries = refresh_queries(&hypervisor, "0d1c-running");

        // Assert
        assert_eq!(
            queries,
            ["uuid", "name", "state", "max_vcpus", "max_memory", "xml_desc"]
        );
    }

    #[test]
    fn test_shutoff_refresh_skips_vcpus_and_keeps_order() {
        // Arrange
        let hypervisor = TestHypervisor::new();
        hypervisor.add_domain(
            TestDomainConfig::new("db")
                .with_uuid("0d1c-shutoff")
                .with_state(DomainState::Shutoff, 1),
        );

        // Act
        let queries = refresh_queries(&hypervisor, "0d1c-shutoff");

        // Assert
        assert_eq!(queries, ["uuid", "name", "state", "max_memory", "xml_desc"]);
    }

    #[test]
    fn test_shutoff_domain_never_queries_vcpus() {
        // Arrange
        let mut mock = MockDomainDriver::new();
        identity(&mut mock);
        mock.expect_state().returning(|| Ok((5, 2)));
        mock.expect_max_vcpus().times(0);
        mock.expect_max_memory().returning(|| Ok(1_048_576));
        mock.expect_xml_desc()
            .returning(|| Ok("<domain/>".to_string()));
        let domain = DomainHandle::from_parts(connection(), Arc::new(mock), "abc-123".to_string());

        // Act
        let snapshot = refresh(&domain).unwrap();

        // Assert
        assert_eq!(snapshot.cpus, None);
        assert_eq!(snapshot.state.state, DomainState::Shutoff);
        assert_eq!(snapshot.state.reason, 2);
        assert_eq!(snapshot.memory.to_string(), "1GB");
    }

    #[test]
    fn test_paused_domain_reports_unknown_vcpus() {
        let mut mock = MockDomainDriver::new();
        identity(&mut mock);
        mock.expect_state().returning(|| Ok((3, 1)));
        mock.expect_max_vcpus().never();
        mock.expect_max_memory().returning(|| Ok(2048));
        mock.expect_xml_desc().returning(|| Ok(String::new()));
        let domain = DomainHandle::from_parts(connection(), Arc::new(mock), "abc-123".to_string());

        let snapshot = refresh(&domain).unwrap();

        assert!(!snapshot.is_running());
        assert!(snapshot.cpus.is_none());
    }

    #[test]
    fn test_failed_read_aborts_refresh() {
        // Arrange
        let mut mock = MockDomainDriver::new();
        identity(&mut mock);
        mock.expect_state().returning(|| Ok((1, 1)));
        mock.expect_max_vcpus()
            .returning(|| Err(DriverError::Operation("internal error".to_string())));
        mock.expect_max_memory().times(0);
        mock.expect_xml_desc().times(0);
        let domain = DomainHandle::from_parts(connection(), Arc::new(mock), "abc-123".to_string());

        // Act
        let err = refresh(&domain).unwrap_err();

        // Assert
        assert_eq!(err.kind(), ErrorKind::HypervisorOperation);
    }

    #[test]
    fn test_lost_connection_maps_to_connection_error() {
        let mut mock = MockDomainDriver::new();
        mock.expect_uuid()
            .returning(|| Err(DriverError::ConnectionLost("broken pipe".to_string())));
        let domain = DomainHandle::from_parts(connection(), Arc::new(mock), "abc-123".to_string());

        let err = refresh(&domain).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_closed_connection_rejects_refresh() {
        // Arrange
        let conn = connection();
        let mut mock = MockDomainDriver::new();
        mock.expect_uuid().times(0);
        let domain = DomainHandle::from_parts(conn.clone(), Arc::new(mock), "abc-123".to_string());
        conn.close().unwrap();

        // Act
        let err = refresh(&domain).unwrap_err();

        // Assert
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!domain.is_valid());
    }

    #[test]
    fn test_memory_argument_is_kib() {
        let mut mock = MockDomainDriver::new();
        identity(&mut mock);
        mock.expect_state().returning(|| Ok((5, 0)));
        mock.expect_max_memory().returning(|| Ok(1536));
        mock.expect_xml_desc().returning(|| Ok(String::new()));
        let domain = DomainHandle::from_parts(connection(), Arc::new(mock), "abc-123".to_string());

        let snapshot = refresh(&domain).unwrap();

        assert_eq!(snapshot.memory, MemorySize::from_kib(1536));
        assert_eq!(snapshot.memory.to_string(), "1536KB");
    }
}
