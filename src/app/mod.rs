//! Application core: session orchestration, zero direct I/O.
//!
//! The rules for driving one pod live here: activation sequencing, nonce
//! bookkeeping, command verification and bolus tracking.  Everything that
//! touches a radio, a disk or a clock goes through the **port traits** in
//! [`ports`], so this layer runs against scripted executors in tests.

pub mod bolus;
pub mod commands;
pub mod events;
pub mod ports;
pub mod responses;
pub mod service;
pub mod setup;
pub mod verify;
