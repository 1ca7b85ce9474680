//! The transition engine: lifecycle commands → hypervisor calls.
//!
//! Every [`Command`] expands to a fixed, ordered plan of [`DomainAction`]s
//! (see `Command::plan`).  This module only walks the plan:
//!
//! - actions run strictly in order, each one blocking until the hypervisor
//!   answers;
//! - the first failure aborts the rest of the plan and is returned,
//!   annotated with the command and the failing action;
//! - nothing is retried, rolled back or treated as a no-op here.  A command
//!   that does not fit the domain's current state is sent anyway and the
//!   hypervisor's rejection is returned as is.
//!
//! The calls block, so async callers hand the work to
//! [`transition_blocking`], which runs it on tokio's blocking pool.

use tracing::{debug, info, warn};
use vmgate_core::{Command, DomainAction, VirtError};

use super::connection::DomainHandle;
use super::driver::{DomainDriver, DriverError};

/// Applies `command` to `domain`.
pub fn transition(domain: &DomainHandle, command: Command) -> Result<(), VirtError> {
    let driver = domain.driver()?;
    info!(domain = %domain.id(), %command, "applying transition");

    for &action in command.plan() {
        debug!(domain = %domain.id(), %command, %action, "issuing hypervisor call");
        apply(driver, action).map_err(|err| {
            warn!(
                domain = %domain.id(),
                %command,
                %action,
                error = %err,
                "transition aborted"
            );
            domain.connection().transition_error(command, action, err)
        })?;
    }
    Ok(())
}

/// Parses `name` (case-insensitively) and applies it.
///
/// # Errors
///
/// `InvalidCommand` for an unrecognised name, before any hypervisor call.
pub fn transition_named(domain: &DomainHandle, name: &str) -> Result<(), VirtError> {
    let command: Command = name.parse()?;
    transition(domain, command)
}

/// Runs [`transition`] on the blocking thread pool.
pub async fn transition_blocking(domain: DomainHandle, command: Command) -> Result<(), VirtError> {
    tokio::task::spawn_blocking(move || transition(&domain, command))
        .await
        .map_err(|err| {
            VirtError::operation_failed(command.as_str(), format!("transition task failed: {err}"))
        })?
}

fn apply(driver: &dyn DomainDriver, action: DomainAction) -> Result<(), DriverError> {
    match action {
        DomainAction::Start => driver.start(),
        DomainAction::Shutdown { grace } => driver.shutdown(grace),
        DomainAction::PowerOff => driver.power_off(),
        DomainAction::Suspend => driver.suspend(),
        DomainAction::Resume => driver.resume(),
        DomainAction::Reboot => driver.reboot(),
        DomainAction::Reset => driver.reset(),
        DomainAction::SaveMemory => driver.save_memory(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::eq;
    use mockall::Sequence;
    use vmgate_core::{ErrorKind, HypervisorId, SHUTDOWN_GRACE};

    use super::*;
    use crate::application::connection::Connection;
    use crate::application::driver::MockDomainDriver;
    use crate::infrastructure::test_driver::TestHypervisor;

    fn handle(mock: MockDomainDriver) -> DomainHandle {
        let conn = Connection::with_driver(
            HypervisorId(1),
            "mock",
            "test:///empty",
            Arc::new(TestHypervisor::new()),
        )
        .unwrap();
        DomainHandle::from_parts(conn, Arc::new(mock), "abc-123".to_string())
    }

    #[test]
    fn test_running_issues_exactly_one_start() {
        // Arrange
        let mut mock = MockDomainDriver::new();
        mock.expect_start().times(1).returning(|| Ok(()));
        let domain = handle(mock);

        // Act / Assert (mock verifies call counts on drop)
        transition(&domain, Command::Running).unwrap();
    }

    #[test]
    fn test_shutdown_uses_grace_flag() {
        let mut mock = MockDomainDriver::new();
        mock.expect_shutdown()
            .with(eq(SHUTDOWN_GRACE))
            .times(1)
            .returning(|_| Ok(()));
        let domain = handle(mock);

        transition(&domain, Command::Shutdown).unwrap();
    }

    #[test]
    fn test_each_single_step_command_calls_its_action() {
        let cases: [(Command, fn(&mut MockDomainDriver)); 6] = [
            (Command::Shutoff, |m| {
                m.expect_power_off().times(1).returning(|| Ok(()));
            }),
            (Command::Suspend, |m| {
                m.expect_suspend().times(1).returning(|| Ok(()));
            }),
            (Command::Resume, |m| {
                m.expect_resume().times(1).returning(|| Ok(()));
            }),
            (Command::Reboot, |m| {
                m.expect_reboot().times(1).returning(|| Ok(()));
            }),
            (Command::Reset, |m| {
                m.expect_reset().times(1).returning(|| Ok(()));
            }),
            (Command::Pause, |m| {
                m.expect_save_memory().times(1).returning(|| Ok(()));
            }),
        ];
        for (command, expect) in cases {
            let mut mock = MockDomainDriver::new();
            expect(&mut mock);
            let domain = handle(mock);
            transition(&domain, command).unwrap();
        }
    }

    #[test]
    fn test_restore_starts_then_resumes() {
        // Arrange
        let mut seq = Sequence::new();
        let mut mock = MockDomainDriver::new();
        mock.expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_resume()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let domain = handle(mock);

        // Act
        let result = transition(&domain, Command::Restore);

        // Assert
        assert!(result.is_ok());
    }

    #[test]
    fn test_restore_aborts_when_start_fails() {
        // Arrange
        let mut mock = MockDomainDriver::new();
        mock.expect_start()
            .times(1)
            .returning(|| Err(DriverError::Operation("no saved image".to_string())));
        mock.expect_resume().times(0);
        let domain = handle(mock);

        // Act
        let err = transition(&domain, Command::Restore).unwrap_err();

        // Assert
        match err {
            VirtError::HypervisorOperation {
                operation,
                command,
                message,
            } => {
                assert_eq!(operation, "start");
                assert_eq!(command, Some(Command::Restore));
                assert_eq!(message, "no saved image");
            }
            other => panic!("expected HypervisorOperation, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_issues_no_calls() {
        // A mock with no expectations panics on any call.
        let domain = handle(MockDomainDriver::new());

        let err = transition_named(&domain, "FLY").unwrap_err();

        assert_eq!(err, VirtError::InvalidCommand("FLY".to_string()));
    }

    #[test]
    fn test_named_command_is_case_insensitive() {
        let mut mock = MockDomainDriver::new();
        mock.expect_suspend().times(1).returning(|| Ok(()));
        let domain = handle(mock);

        transition_named(&domain, "suspend").unwrap();
    }

    #[test]
    fn test_state_mismatch_is_passed_through() {
        // Arrange
        let mut mock = MockDomainDriver::new();
        mock.expect_start().times(1).returning(|| {
            Err(DriverError::operation_invalid("domain is already running"))
        });
        let domain = handle(mock);

        // Act
        let err = transition(&domain, Command::Running).unwrap_err();

        // Assert
        assert_eq!(err.kind(), ErrorKind::HypervisorOperation);
        assert!(err.is_operation_invalid());
    }

    #[test]
    fn test_closed_connection_rejects_transition() {
        let domain = handle(MockDomainDriver::new());
        domain.connection().close().unwrap();

        let err = transition(&domain, Command::Running).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_transition_blocking_runs_off_the_runtime() {
        let mut mock = MockDomainDriver::new();
        mock.expect_reboot().times(1).returning(|| Ok(()));
        let domain = handle(mock);

        transition_blocking(domain, Command::Reboot).await.unwrap();
    }
}
