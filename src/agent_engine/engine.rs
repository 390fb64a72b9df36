use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::action::render::ScriptRenderer;
use crate::action::types::TerminalKind;
use crate::action::{CompileOptions, DeviceOperation, InputMode};
use crate::agent_engine::history::{HistoryEntry, SessionHistory};
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::state::{EndReason, EpisodeState, LoopConfig, RoundResult};
use crate::controller::VmController;
use crate::dialect::{extract, Code, CodeBlock, Dialect, ExtractContext};
use crate::errors::{HarnessError, HarnessResult};
use crate::llm::provider::ModelClient;
use crate::llm::types::{ChatMessage, ContentPart, ModelResponse};
use crate::perception::marks::{draw_marks, Tag};
use crate::perception::resize::PixelBudget;
use crate::perception::screenshot::{prepare_for_model, PreparedScreenshot};
use crate::perception::types::Observation;
use crate::primitive::{interpret, invocable_names, StepOutcome, Termination};
use crate::prompt::{grounder_prompt, plan_message, system_prompt, PromptContext};

const OBSERVATION_PROMPT: &str = "Here is the current screenshot. Predict the next action.";

/// Everything an episode needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EpisodeSettings {
    pub dialect: Dialect,
    pub input_mode: InputMode,
    pub app_name: String,
    pub instruction: String,
    pub vm_password: Option<String>,
    pub set_of_marks: bool,
    pub context_window: usize,
    pub model_timeout: Duration,
    pub loop_config: LoopConfig,
    pub history_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EpisodeResult {
    pub end: EndReason,
    pub steps: u32,
    pub session_id: String,
}

impl EpisodeResult {
    pub fn termination(&self) -> Option<&Termination> {
        self.end.termination()
    }
}

/// One finished round kept for the model's context.
struct Round {
    screenshot_url: String,
    reply: String,
}

/// Second model that turns a planner's plain-language step into actions.
pub struct Grounder {
    pub dialect: Dialect,
    pub model: Arc<dyn ModelClient>,
}

/// Outcome of one model call.
enum Asked {
    Reply(ModelResponse),
    Next(EpisodeState),
}

/// The current screen as the model and the executor see it.
struct CurrentView {
    prepared: PreparedScreenshot,
    tags: Option<Vec<Tag>>,
}

pub struct Episode {
    state: EpisodeState,
    settings: EpisodeSettings,
    vm: Arc<dyn VmController>,
    model: Arc<dyn ModelClient>,
    grounder: Option<(Grounder, String)>,
    loop_ctrl: LoopController,
    history: SessionHistory,
    cancel: Arc<AtomicBool>,
    system_prompt: String,
    rounds: VecDeque<Round>,
    view: Option<CurrentView>,
}

impl Episode {
    pub fn new(
        settings: EpisodeSettings,
        vm: Arc<dyn VmController>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        let system_prompt = system_prompt(settings.dialect, &prompt_context(&settings));
        Self {
            state: EpisodeState::Observing,
            loop_ctrl: LoopController::new(settings.loop_config),
            history: SessionHistory::new(settings.history_dir.as_deref()),
            settings,
            vm,
            model,
            grounder: None,
            cancel: Arc::new(AtomicBool::new(false)),
            system_prompt,
            rounds: VecDeque::new(),
            view: None,
        }
    }

    /// Descriptive replies are handed to `grounder` together with the
    /// screenshot and its actions run in their place.
    pub fn with_grounder(mut self, grounder: Grounder) -> Self {
        let prompt = grounder_prompt(grounder.dialect, &prompt_context(&self.settings));
        self.grounder = Some((grounder, prompt));
        self
    }

    /// Setting the flag stops the episode at the next group boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub async fn run(mut self) -> EpisodeResult {
        tracing::info!(
            session = %self.history.session_id,
            dialect = %self.settings.dialect,
            model = %self.model.name(),
            "episode started"
        );
        self.history.record(HistoryEntry::new(0, "system").content(self.system_prompt.clone()));

        let end = loop {
            if self.cancelled() {
                self.state = EpisodeState::Finished { end: EndReason::Cancelled };
            }

            match self.state.clone() {
                EpisodeState::Observing => {
                    if let Some(end) = self.loop_ctrl.should_stop() {
                        tracing::info!(?end, "loop controller triggered stop");
                        self.state = EpisodeState::Finished { end };
                        continue;
                    }
                    match self.observe().await {
                        Ok(view) => {
                            self.view = Some(view);
                            self.state = EpisodeState::Querying;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "observation failed");
                            self.loop_ctrl.record_step();
                            self.fail_round(RoundResult::Failed { error: e.to_string() });
                        }
                    }
                }

                EpisodeState::Querying => {
                    self.loop_ctrl.record_step();
                    self.state = self.query().await;
                }

                EpisodeState::Executing { blocks } => {
                    self.state = self.execute(blocks).await;
                }

                EpisodeState::Finished { end } => break end,
            }

            tokio::task::yield_now().await;
        };

        tracing::info!(session = %self.history.session_id, ?end, "episode ended");
        self.history.record(
            HistoryEntry::new(self.loop_ctrl.steps(), "end")
                .action(serde_json::to_value(&end).unwrap_or_default()),
        );
        EpisodeResult {
            end,
            steps: self.loop_ctrl.steps(),
            session_id: self.history.session_id.clone(),
        }
    }

    fn fail_round(&mut self, result: RoundResult) {
        self.loop_ctrl.record_failure();
        self.history.record(
            HistoryEntry::new(self.loop_ctrl.steps(), "executor")
                .action(serde_json::to_value(&result).unwrap_or_default()),
        );
        self.state = EpisodeState::Observing;
    }

    async fn observe(&self) -> HarnessResult<CurrentView> {
        let screenshot = self.vm.screenshot().await?;
        let tags = if self.settings.set_of_marks {
            self.vm.set_of_marks().await?
        } else {
            None
        };
        let observation = Observation { screenshot, tags };

        let image = match &observation.tags {
            Some(tags) => draw_marks(&observation.screenshot, tags)?,
            None => observation.screenshot,
        };
        let prepared = prepare_for_model(&image, &PixelBudget::default())?;
        Ok(CurrentView { prepared, tags: observation.tags })
    }

    fn build_messages(&self, view: &CurrentView) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        for round in &self.rounds {
            messages.push(ChatMessage::user(vec![
                ContentPart::image(round.screenshot_url.clone()),
                ContentPart::text(OBSERVATION_PROMPT),
            ]));
            messages.push(ChatMessage::assistant(round.reply.clone()));
        }
        messages.push(ChatMessage::user(vec![
            ContentPart::image(view.prepared.data_url()),
            ContentPart::text(OBSERVATION_PROMPT),
        ]));
        messages
    }

    fn compile_options(&self, view: &CurrentView, dialect: Dialect) -> CompileOptions {
        dialect.compile_options(
            view.prepared.meta.original_width,
            view.prepared.meta.original_height,
            self.settings.input_mode,
        )
    }

    async fn ask(&mut self, model: Arc<dyn ModelClient>, messages: Vec<ChatMessage>, step: u32) -> Asked {
        match tokio::time::timeout(self.settings.model_timeout, model.chat(messages)).await {
            Err(_) => {
                tracing::warn!(step, model = %model.name(), secs = self.settings.model_timeout.as_secs(), "model timed out");
                Asked::Next(EpisodeState::Finished {
                    end: EndReason::Terminated { termination: Termination::Timeout },
                })
            }
            Ok(Err(e)) => {
                tracing::error!(step, model = %model.name(), error = %e, "model call failed");
                self.fail_round(RoundResult::Failed { error: e.to_string() });
                Asked::Next(EpisodeState::Observing)
            }
            Ok(Ok(reply)) => Asked::Reply(reply),
        }
    }

    async fn query(&mut self) -> EpisodeState {
        let Some(view) = self.view.take() else {
            return EpisodeState::Observing;
        };
        let step = self.loop_ctrl.steps();
        let messages = self.build_messages(&view);
        tracing::info!(step, messages = messages.len(), "Querying → calling model");

        let model = Arc::clone(&self.model);
        let reply = match self.ask(model, messages, step).await {
            Asked::Reply(reply) => reply,
            Asked::Next(state) => return state,
        };

        let raw = reply.single_text().map(str::to_string).unwrap_or_default();
        self.history.record(HistoryEntry::new(step, "assistant").content(raw.clone()));

        let ctx = ExtractContext::new(self.compile_options(&view, self.settings.dialect)).with_tags(view.tags.clone());
        let mut blocks = match extract(&reply, self.settings.dialect, &ctx) {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::error!(step, error = %e, raw = %raw, "response rejected");
                self.fail_round(RoundResult::Failed { error: e.to_string() });
                return EpisodeState::Observing;
            }
        };

        let plan = match blocks.first() {
            Some(CodeBlock { code: Code::Script(plan), is_descriptive: true, .. }) if self.grounder.is_some() => {
                Some(plan.clone())
            }
            _ => None,
        };
        if let Some(plan) = plan {
            blocks = match self.ground(&view, &plan, step).await {
                Ok(grounded) => grounded,
                Err(state) => return state,
            };
        }

        self.rounds.push_back(Round {
            screenshot_url: view.prepared.data_url(),
            reply: raw,
        });
        while self.rounds.len() > self.settings.context_window {
            self.rounds.pop_front();
        }
        self.view = Some(view);
        EpisodeState::Executing { blocks }
    }

    /// Asks the grounder to act out `plan` on the current screen.
    async fn ground(&mut self, view: &CurrentView, plan: &str, step: u32) -> Result<Vec<CodeBlock>, EpisodeState> {
        let Some((grounder, prompt)) = &self.grounder else {
            return Ok(Vec::new());
        };
        let dialect = grounder.dialect;
        let model = Arc::clone(&grounder.model);
        let messages = vec![
            ChatMessage::system(prompt.clone()),
            ChatMessage::user(vec![
                ContentPart::image(view.prepared.data_url()),
                ContentPart::text(plan_message(plan)),
            ]),
        ];
        tracing::info!(step, grounder = %dialect, "Querying → grounding plan");

        let reply = match self.ask(model, messages, step).await {
            Asked::Reply(reply) => reply,
            Asked::Next(state) => return Err(state),
        };
        let raw = reply.single_text().map(str::to_string).unwrap_or_default();
        self.history.record(HistoryEntry::new(step, "grounder").content(raw.clone()));

        let ctx = ExtractContext::new(self.compile_options(view, dialect)).with_tags(view.tags.clone());
        let error = match extract(&reply, dialect, &ctx) {
            Ok(blocks) if blocks.iter().any(|b| !b.is_descriptive) => return Ok(blocks),
            Ok(_) => "grounder returned no action".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::error!(step, error = %error, raw = %raw, "grounding rejected");
        self.fail_round(RoundResult::Failed { error });
        Err(EpisodeState::Observing)
    }

    async fn execute(&mut self, blocks: Vec<CodeBlock>) -> EpisodeState {
        let step = self.loop_ctrl.steps();
        let (width, height) = self
            .view
            .as_ref()
            .map(|v| (v.prepared.meta.original_width, v.prepared.meta.original_height))
            .unwrap_or_default();
        let renderer = ScriptRenderer::new(width, height);
        let primitives = invocable_names();

        for block in &blocks {
            if block.is_descriptive {
                tracing::debug!(step, "descriptive block skipped");
                continue;
            }
            match &block.code {
                Code::Script(code) if block.is_primitive(&primitives) => {
                    let outcome = match interpret(code) {
                        Ok(invocation) => invocation.run().await,
                        Err(e) => {
                            tracing::warn!(step, code = %code, error = %e, "bad primitive");
                            self.fail_round(RoundResult::Failed { error: e.to_string() });
                            return EpisodeState::Observing;
                        }
                    };
                    if let StepOutcome::Terminate(termination) = outcome {
                        tracing::info!(step, ?termination, "primitive terminated the episode");
                        return EpisodeState::Finished { end: EndReason::Terminated { termination } };
                    }
                }
                Code::Script(code) => {
                    let script = with_prefix(block.prefix.as_deref(), code);
                    if let Err(e) = self.run_script(&script).await {
                        self.fail_round(RoundResult::Failed { error: e.to_string() });
                        return EpisodeState::Observing;
                    }
                }
                Code::Operations(groups) => {
                    for group in groups {
                        if self.cancelled() {
                            return EpisodeState::Finished { end: EndReason::Cancelled };
                        }
                        if let Some(kind) = group.iter().find_map(terminal_kind) {
                            let termination = match kind {
                                TerminalKind::Done => Termination::Done,
                                TerminalKind::Fail => Termination::Fail,
                            };
                            return EpisodeState::Finished { end: EndReason::Terminated { termination } };
                        }
                        if group.iter().all(DeviceOperation::is_wait) {
                            let secs: f64 = group.iter().map(wait_secs).sum();
                            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                            continue;
                        }
                        let script = with_prefix(block.prefix.as_deref(), &renderer.render_group(group));
                        if let Err(e) = self.run_script(&script).await {
                            self.fail_round(RoundResult::Failed { error: e.to_string() });
                            return EpisodeState::Observing;
                        }
                    }
                }
            }
        }

        self.loop_ctrl.record_success();
        let result = RoundResult::Executed { blocks: blocks.len() };
        self.history.record(
            HistoryEntry::new(step, "executor").action(serde_json::to_value(&result).unwrap_or_default()),
        );
        EpisodeState::Observing
    }

    async fn run_script(&self, script: &str) -> HarnessResult<()> {
        tracing::debug!(script = %script, "executing script");
        if self.vm.execute_python(script).await {
            Ok(())
        } else {
            Err(HarnessError::Controller("script execution failed".into()))
        }
    }
}

fn prompt_context(settings: &EpisodeSettings) -> PromptContext<'_> {
    PromptContext {
        app_name: &settings.app_name,
        instruction: &settings.instruction,
        set_of_marks: settings.set_of_marks,
        vm_password: settings.vm_password.as_deref(),
    }
}

fn with_prefix(prefix: Option<&str>, script: &str) -> String {
    match prefix {
        Some(p) => format!("{p}\n{script}"),
        None => script.to_string(),
    }
}

fn terminal_kind(op: &DeviceOperation) -> Option<TerminalKind> {
    match op {
        DeviceOperation::Terminal { kind } => Some(*kind),
        _ => None,
    }
}

fn wait_secs(op: &DeviceOperation) -> f64 {
    match op {
        DeviceOperation::Wait { seconds } => *seconds,
        _ => 0.0,
    }
}
