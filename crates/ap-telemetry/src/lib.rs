//! Logging and span helpers shared by the autopilot crates.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Spans**: trace/span id generation so interleaved background ticks
//!   can be correlated in the log stream

pub mod logging;
pub mod tracing_setup;
