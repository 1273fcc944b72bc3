//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one part of the
//! orchestrator against mock adapters.  Timings are scaled down so the
//! background tasks finish in milliseconds.

mod bolus_tests;
mod mock_pod;
mod setup_tests;
