use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Terminal state reported by the portfolio solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    Optimal,
    /// Line search could not find descent while the projected step was still
    /// above tolerance. Weights are feasible but not certified optimal.
    Stalled,
    Infeasible,
    IterationLimit,
    Singular,
}

impl SolverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverStatus::Optimal => "optimal",
            SolverStatus::Stalled => "stalled",
            SolverStatus::Infeasible => "infeasible",
            SolverStatus::IterationLimit => "iteration_limit",
            SolverStatus::Singular => "singular",
        }
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Numerical error ({status}): {message}")]
    Numerical {
        status: SolverStatus,
        message: String,
    },

    #[error("Constraint violation: {}", failed.join(", "))]
    ConstraintViolation { failed: Vec<String> },

    #[error("Blocked by compliance: {0}")]
    Blocked(String),

    #[error("Run cancelled after {completed}/{total} rebalance steps")]
    Cancelled { completed: usize, total: usize },

    #[error("Worker failure: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] bincode::Error),
}

impl EngineError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn numerical<S: Into<String>>(status: SolverStatus, message: S) -> Self {
        Self::Numerical {
            status,
            message: message.into(),
        }
    }

    pub fn no_data() -> Self {
        Self::Validation("no data".to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numerical_error_carries_solver_status() {
        let error = EngineError::numerical(SolverStatus::Infeasible, "sector caps too tight");
        assert_eq!(
            error.to_string(),
            "Numerical error (infeasible): sector caps too tight"
        );
    }

    #[test]
    fn constraint_violation_lists_categories() {
        let error = EngineError::ConstraintViolation {
            failed: vec!["budget".to_string(), "max_position".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "Constraint violation: budget, max_position"
        );
    }
}
