//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scripted adapter that fails chosen write calls
//! - Failing event sink and conflict queue
//! - Record fixtures and a context builder

#![allow(dead_code)]

pub mod fixtures;
pub mod scripted;

pub use fixtures::*;
pub use scripted::*;
