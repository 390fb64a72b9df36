//! Task files and the end-to-end task runner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent_engine::engine::{Episode, EpisodeResult, EpisodeSettings, Grounder};
use crate::agent_engine::state::LoopConfig;
use crate::config::AppConfig;
use crate::controller::{AppController, AppKind, Command, VmController};
use crate::errors::HarnessResult;
use crate::evaluator::{evaluate_episode, needs_state, EvalReport, TaskAssertion};
use crate::llm::provider::ModelClient;

/// One setup step from a task's `initialize` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "func", rename_all = "snake_case")]
pub enum InitStep {
    Execute {
        command: Command,
        #[serde(default)]
        shell: bool,
    },
    Launch {
        command: Command,
        #[serde(default)]
        shell: bool,
    },
    Sleep {
        seconds: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub app: AppKind,
    #[serde(default)]
    pub instruction: String,
    /// Passed to the application's status dump.
    #[serde(default)]
    pub query: Value,
    #[serde(default)]
    pub evaluate: Vec<TaskAssertion>,
    #[serde(default)]
    pub initialize: Vec<InitStep>,
}

impl TaskConfig {
    pub fn from_json(content: &str) -> HarnessResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let task = Self::from_json(&std::fs::read_to_string(path)?)?;
        tracing::info!(
            path = %path.display(),
            app = %task.app,
            assertions = task.evaluate.len(),
            "task loaded"
        );
        Ok(task)
    }
}

/// Runs the reset command and every setup step in order, pausing `settle`
/// after each. Returns whether all of them succeeded; failures are logged
/// and do not stop the remaining steps.
pub async fn initialize(
    vm: &dyn VmController,
    steps: &[InitStep],
    reset_command: Option<&str>,
    settle: Duration,
) -> bool {
    let mut all_ok = true;
    if let Some(reset) = reset_command {
        let ok = vm.execute(&Command::Line(reset.to_string()), true).await;
        tracing::info!(ok, "API server reset");
        all_ok &= ok;
    }
    for (index, step) in steps.iter().enumerate() {
        let ok = match step {
            InitStep::Execute { command, shell } => vm.execute(command, *shell).await,
            InitStep::Launch { command, shell } => vm.launch(command, *shell).await,
            InitStep::Sleep { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                true
            }
        };
        if !ok {
            tracing::warn!(index, ?step, "setup step failed");
        }
        all_ok &= ok;
        tokio::time::sleep(settle).await;
    }
    all_ok
}

/// Final result of one task.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub task_id: Option<String>,
    pub app: AppKind,
    pub initialized: bool,
    pub episode: EpisodeResult,
    pub report: EvalReport,
}

pub struct TaskRunner {
    pub vm: Arc<dyn VmController>,
    pub app: Arc<dyn AppController>,
    pub model: Arc<dyn ModelClient>,
    pub grounder: Option<Grounder>,
}

impl TaskRunner {
    pub fn settings(config: &AppConfig, task: &TaskConfig) -> EpisodeSettings {
        EpisodeSettings {
            dialect: config.agent.code_style,
            input_mode: config.agent.input_mode,
            app_name: task.app.name().to_string(),
            instruction: task.instruction.clone(),
            vm_password: config.vm.password.clone(),
            set_of_marks: config.agent.set_of_marks,
            context_window: config.agent.context_window,
            model_timeout: Duration::from_secs(config.model.timeout_secs),
            loop_config: LoopConfig {
                max_steps: config.agent.max_steps,
                max_consecutive_failures: config.agent.max_consecutive_failures,
            },
            history_dir: config.agent.history_dir.clone(),
        }
    }

    /// Setup, episode, state dump and evaluation.
    pub async fn run(&self, config: &AppConfig, task: &TaskConfig) -> Verdict {
        let initialized = initialize(
            self.vm.as_ref(),
            &task.initialize,
            config.vm.reset_command.as_deref(),
            Duration::from_secs_f64(config.agent.init_settle_secs.max(0.0)),
        )
        .await;

        let mut episode = Episode::new(Self::settings(config, task), Arc::clone(&self.vm), Arc::clone(&self.model));
        if let Some(grounder) = &self.grounder {
            episode = episode.with_grounder(Grounder {
                dialect: grounder.dialect,
                model: Arc::clone(&grounder.model),
            });
        }
        let result = episode.run().await;

        let state = if needs_state(&task.evaluate) {
            match self.app.status_dump(&task.query).await {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!(app = %task.app, error = %e, "status dump failed");
                    None
                }
            }
        } else {
            None
        };

        let report = evaluate_episode(&task.evaluate, result.termination(), state.as_ref());
        tracing::info!(passed = report.passed, steps = result.steps, "task evaluated");
        Verdict {
            task_id: task.id.clone(),
            app: task.app,
            initialized,
            episode: result,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_files_parse() {
        let task = TaskConfig::from_json(
            r#"{
                "id": "celestia-001",
                "type": "Celestia",
                "instruction": "Zoom in to level 5.",
                "query": ["zoom_level"],
                "evaluate": [{"type": "value", "key": "zoom_level", "value": 5}],
                "initialize": [
                    {"func": "launch", "command": ["celestia", "--port", "«PORTLIKE»"]},
                    {"func": "sleep", "seconds": 1.5},
                    {"func": "execute", "command": "xdotool key F11", "shell": true}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(task.app, AppKind::Celestia);
        assert_eq!(task.initialize.len(), 3);
        assert_eq!(task.initialize[1], InitStep::Sleep { seconds: 1.5 });
        assert!(matches!(&task.initialize[2], InitStep::Execute { shell: true, .. }));
    }

    #[test]
    fn unknown_app_or_bad_assertion_fails_at_load() {
        assert!(TaskConfig::from_json(r#"{"type": "Blender"}"#).is_err());
        assert!(TaskConfig::from_json(
            r#"{"type": "KAlgebra", "evaluate": [{"type": "v", "key": "lambda x: exec('1')", "value": 1}]}"#
        )
        .is_err());
    }
}
