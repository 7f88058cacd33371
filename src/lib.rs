//!
//! two_phase_commit
//! A three-role two-phase-commit protocol over TCP: a primary
//! coordinator, a fail-safe coordinator, and any number of
//! participants. Split into a library and a thin binary (grounded on
//! the workspace-splitting convention seen elsewhere in the example
//! pack) so the wire protocol and each role's state machine can be
//! exercised directly from integration tests without going through a
//! spawned process.
//!
pub mod cli;
pub mod coordinator;
pub mod error;
pub mod failsafe;
pub mod net;
pub mod oplog;
pub mod participant;
pub mod protocol;
pub mod resource_manager;
