//! Common utilities for usbmuxd-rs
//!
//! This crate provides the synchronization primitives shared by the device
//! manager and its devices, logging setup, the common error type, and the
//! scriptable mock transport used by tests across the workspace.

pub mod error;
pub mod event;
pub mod guarded_set;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use event::BroadcastEvent;
pub use guarded_set::GuardedSet;
pub use logging::{setup_logging, setup_test_logging};
