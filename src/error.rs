use thiserror::Error;

/// Errors surfaced while building or running a simulation.
///
/// None of these are recovered internally; the engines themselves cannot fail
/// during normal operation.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("state enumeration exceeded the limit of {limit} states")]
    Unreachable { limit: usize },
    #[error("simulation cancelled")]
    Cancelled,
    #[error("wall-clock deadline exceeded")]
    Timeout,
}
