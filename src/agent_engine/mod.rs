pub mod engine;
pub mod history;
pub mod loop_control;
pub mod state;

pub use engine::{Episode, EpisodeResult, EpisodeSettings, Grounder};
pub use state::{EndReason, LoopConfig};
