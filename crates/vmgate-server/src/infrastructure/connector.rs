//! URI-based driver selection.
//!
//! The scheme of a connection URI picks the driver: `test:///default` opens
//! the in-memory [`TestHypervisor`], anything else is refused with the native
//! "no connection driver available" message.

use std::sync::Arc;

use tracing::debug;

use crate::application::driver::{DriverConnector, DriverError, HypervisorDriver};
use crate::infrastructure::test_driver::TestHypervisor;

/// Opens drivers by URI scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct UriConnector;

impl DriverConnector for UriConnector {
    fn open(&self, uri: &str) -> Result<Arc<dyn HypervisorDriver>, DriverError> {
        let scheme = uri.split_once(':').map(|(scheme, _)| scheme).unwrap_or(uri);
        debug!(%uri, %scheme, "opening hypervisor driver");
        match scheme {
            "test" => Ok(Arc::new(TestHypervisor::from_uri(uri)?)),
            _ => Err(DriverError::Operation(format!(
                "no connection driver available for {uri}"
            ))),
        }
    }
}
