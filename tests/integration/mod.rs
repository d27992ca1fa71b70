//! Integration tests for the supervisor, the probe and the services.
//!
//! The scenarios drive the real binaries through [`ProcessTestHarness`] or
//! the library in-process, always against a private socket directory.

pub mod infrastructure;

pub use infrastructure::{ProcessTestHarness, SocketTestUtils, TestProcess};
