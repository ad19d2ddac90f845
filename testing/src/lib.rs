//! Shared test fixtures for the Loreforge workspace.
//!
//! Provides a single, shared Redis testcontainer (port 6379) across all test
//! files. The fixture is lazily initialized once per test process and cleaned
//! up when the process exits. When Docker is unavailable the fixture is
//! `None` and callers skip.

mod fixtures;

pub use fixtures::*;
