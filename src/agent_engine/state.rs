use serde::{Deserialize, Serialize};

use crate::dialect::CodeBlock;
use crate::primitive::Termination;

/// Lifecycle states of one episode.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EpisodeState {
    Observing,
    Querying,
    Executing { blocks: Vec<CodeBlock> },
    Finished { end: EndReason },
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// The model (or the model timeout) ended the episode.
    Terminated { termination: Termination },
    StepLimit,
    FailureLimit,
    Cancelled,
}

impl EndReason {
    pub fn termination(&self) -> Option<&Termination> {
        match self {
            Self::Terminated { termination } => Some(termination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_steps: u32,
    pub max_consecutive_failures: u32,
}

/// What happened to one round's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundResult {
    Executed { blocks: usize },
    Failed { error: String },
}

impl RoundResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
