//! Integration tests for vigil.
//!
//! Consolidated into a single binary to reduce link time.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod heartbeat_flow;
mod process_agent;
mod scheduler_resume;
mod session_crash_safety;
