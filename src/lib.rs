pub mod action;
pub mod agent_engine;
pub mod config;
pub mod controller;
pub mod dialect;
pub mod errors;
pub mod evaluator;
pub mod grammar;
pub mod llm;
pub mod perception;
pub mod primitive;
pub mod prompt;
pub mod task;

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
