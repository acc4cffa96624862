#![forbid(unsafe_code)]

//! # testbay
//!
//! The shared code for testbay. Encapsulates abstractions for things like:
//!
//! - The job and step state machine driven by remote test hosts
//! - The job registry ([`center::JobCenter`]) and test plan workers
//! - Inventories of hosts, profiles, test suites and test plans, gathered
//!   from pluggable backends
//!   - Local files and a TFTP tree
//!   - A libvirt hypervisor
//!   - A Cobbler provisioning server
//! - Logging and tracing

pub mod backends;
pub mod bootstrap;
pub mod center;
pub mod error;
pub mod hooks;
pub mod host;
pub mod inventory;
pub mod job;
pub mod log;
pub mod planner;
pub mod process;
pub mod profile;
pub mod session;
pub mod testplan;
pub mod testsuite;

#[cfg(test)]
pub(crate) mod testing;
