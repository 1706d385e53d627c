//! Errors surfaced at the monitor's public boundary.
//!
//! Per-task provider and store failures never show up here; they are
//! logged and retried on the next tick.

use thiserror::Error;

use crate::scheduler::SchedulerState;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Rejected configuration (empty location set, zero interval, ...)
    #[error("Config error: {0}")]
    Config(String),

    /// Lifecycle operation not allowed in the current state
    #[error("Invalid state: cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: SchedulerState,
    },

    /// Not usable in the current execution context
    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
