//! Core types, configuration and persistence seams for the autopilot
//! execution engine.

pub mod config;
pub mod mission;
pub mod queue;
pub mod session_store;
pub mod storage;
pub mod types;
