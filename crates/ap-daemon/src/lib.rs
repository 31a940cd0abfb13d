//! Background services for the autopilot engine.
//!
//! - [`queue::QueueProcessor`]: runs one queued item per tick
//! - [`sweeper::ResourceSweeper`]: reclaims idle per-session resources
//! - [`heartbeat::HealthMonitor`]: alerts once per stale-session episode
//! - [`daemon::DaemonSupervisor`]: owns and (re)arms the subsystem timers

pub mod alerts;
pub mod daemon;
pub mod heartbeat;
pub mod queue;
pub mod sweeper;
