//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and take time as an explicit parameter, so every rule here is testable
//! without processes, sockets, or sleeping.

pub mod invariants;
pub mod message;
pub mod phase;
pub mod resume;
pub mod types;
pub mod watchdog;
