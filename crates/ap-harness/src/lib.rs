//! Harness: timing and lifecycle primitives for the autopilot background
//! subsystems.
//!
//! - [`timer::PeriodicTimer`]: named, idempotent recurring callback
//! - [`shutdown::ShutdownSignal`]: cooperative stop flag used by timer loops

pub mod shutdown;
pub mod timer;
