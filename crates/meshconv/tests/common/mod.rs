//! Shared utilities for meshconv integration tests.
//!
//! - `TestHarness` wires a store, queue and service over temp directories
//! - `stubs` holds converter doubles that succeed, fail or block on demand

pub mod harness;
pub mod stubs;

pub use harness::{HarnessSettings, TestHarness};
pub use stubs::*;
