//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file named on the command line.
//! - Providing working defaults when the file does not exist yet.
//! - Turning the `[[hypervisors]]` table into connection endpoints.

pub mod config;
