//! ork - multi-instance coordination and durable queue processing for agent hooks

pub mod commands;
pub mod config;
pub mod coordination;
pub mod error;
pub mod hooks;
pub mod queue;
pub mod telemetry;
