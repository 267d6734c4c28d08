use std::fmt;

use conciliar_recover::RecoverError;

#[derive(Debug)]
pub enum EngineError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (bad threshold, non-positive window, etc.).
    ConfigValidation(String),
    /// Malformed invoice or payment record.
    InvalidInput(String),
    /// A solver phase exceeded its time slice. Recoverable: the best
    /// feasible point (or the previous phase's) is used.
    SolverTimeout { cluster_id: String, phase: u8 },
    /// Phase 1 found no feasible assignment; the cluster goes to rescue as
    /// a manual-review candidate.
    SolverInfeasible { cluster_id: String },
    /// A rescue merge exceeded the cluster size cap.
    ClusterHardStop { cluster_id: String, size: usize },
    /// Bank-statement recovery failed.
    Recovery(RecoverError),
    /// Cancellation observed at a stage boundary or solver checkpoint.
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::SolverTimeout { cluster_id, phase } => {
                write!(f, "cluster '{cluster_id}': phase {phase} hit its time slice")
            }
            Self::SolverInfeasible { cluster_id } => {
                write!(f, "cluster '{cluster_id}': phase 1 infeasible")
            }
            Self::ClusterHardStop { cluster_id, size } => {
                write!(f, "cluster '{cluster_id}': merge reached {size} nodes, over the hard stop")
            }
            Self::Recovery(e) => write!(f, "bank recovery failed: {e}"),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Recovery(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RecoverError> for EngineError {
    fn from(e: RecoverError) -> Self {
        Self::Recovery(e)
    }
}
