//! Pod session orchestrator.
//!
//! Drives one wireless insulin pod through activation, delivery and
//! deactivation on behalf of a host application.  The host supplies a
//! command executor (the radio link), a session store, an event sink and a
//! clock; [`PodManager`] does the rest.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod error;
pub mod pod;
pub mod task;

pub use app::bolus::{BolusHandle, BolusResult, ProgressCallback};
pub use app::service::PodManager;
pub use app::setup::{SetupActionResult, SetupTask};
pub use config::PodConfig;
pub use error::{CommandError, CommandErrorKind, Error, Result};
