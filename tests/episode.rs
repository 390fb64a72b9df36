use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use scibench::agent_engine::{EndReason, Episode, Grounder};
use scibench::config::{parse_config, AppConfig};
use scibench::controller::{AppController, AppKind, Command, VmController};
use scibench::errors::{HarnessError, HarnessResult};
use scibench::llm::provider::ModelClient;
use scibench::llm::types::{ChatMessage, ModelResponse};
use scibench::perception::marks::Tag;
use scibench::primitive::Termination;
use scibench::task::{TaskConfig, TaskRunner};

fn screenshot_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 40, 40]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

#[derive(Default)]
struct FakeVm {
    commands: Mutex<Vec<Command>>,
    scripts: Mutex<Vec<String>>,
    tags: Option<Vec<Tag>>,
    /// Raised as soon as a script runs.
    cancel_on_script: Mutex<Option<Arc<AtomicBool>>>,
}

#[async_trait]
impl VmController for FakeVm {
    fn vm_ip(&self) -> &str {
        "127.0.0.1"
    }

    async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        Ok(screenshot_png(1280, 720))
    }

    async fn execute(&self, command: &Command, _shell: bool) -> bool {
        self.commands.lock().unwrap().push(command.clone());
        true
    }

    async fn launch(&self, command: &Command, _shell: bool) -> bool {
        self.commands.lock().unwrap().push(command.clone());
        true
    }

    async fn execute_python(&self, script: &str) -> bool {
        self.scripts.lock().unwrap().push(script.to_string());
        if let Some(cancel) = self.cancel_on_script.lock().unwrap().as_ref() {
            cancel.store(true, Ordering::SeqCst);
        }
        true
    }

    async fn set_of_marks(&self) -> HarnessResult<Option<Vec<Tag>>> {
        Ok(self.tags.clone())
    }
}

struct FakeApp {
    state: Value,
}

#[async_trait]
impl AppController for FakeApp {
    fn kind(&self) -> AppKind {
        AppKind::Celestia
    }

    async fn status_dump(&self, _query: &Value) -> HarnessResult<Value> {
        Ok(self.state.clone())
    }
}

/// Replays scripted replies, then repeats `fallback` forever.
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    delay: Duration,
}

impl ScriptedModel {
    fn new(replies: &[&str], fallback: &str) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            fallback: fallback.to_string(),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> HarnessResult<ModelResponse> {
        if messages.is_empty() {
            return Err(HarnessError::Model("no messages".into()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        Ok(ModelResponse::from_text(next.unwrap_or_else(|| self.fallback.clone())))
    }
}

fn config(history_dir: &Path, extra_agent: &str) -> AppConfig {
    config_for(history_dir, "uitars1_5", extra_agent)
}

/// `extra` lands at the end of `[agent]`, so it may open further tables.
fn config_for(history_dir: &Path, code_style: &str, extra: &str) -> AppConfig {
    parse_config(&format!(
        r#"
[model]
api_base = "http://localhost:9/v1/chat/completions"
model = "ui-tars-1.5-7b"

[vm]
ip = "127.0.0.1"

[agent]
code_style = "{code_style}"
init_settle_secs = 0.0
history_dir = "{}"
{extra}
"#,
        history_dir.display()
    ))
    .unwrap()
}

const GROUNDER_SECTION: &str = r#"
[grounder]
code_style = "uground"
api_base = "http://localhost:9/v1/chat/completions"
model = "uground-v1-7b"
"#;

fn task(evaluate: Value) -> TaskConfig {
    serde_json::from_value(json!({
        "id": "celestia-zoom",
        "type": "Celestia",
        "instruction": "Zoom in.",
        "query": ["zoom_level"],
        "evaluate": evaluate,
        "initialize": [
            {"func": "launch", "command": ["celestia", "--port", "«PORTLIKE»"]},
            {"func": "sleep", "seconds": 0}
        ]
    }))
    .unwrap()
}

fn runner(vm: Arc<FakeVm>, state: Value, model: ScriptedModel) -> TaskRunner {
    TaskRunner {
        vm,
        app: Arc::new(FakeApp { state }),
        model: Arc::new(model),
        grounder: None,
    }
}

fn grounded_runner(vm: Arc<FakeVm>, config: &AppConfig, planner: ScriptedModel, grounder: ScriptedModel) -> TaskRunner {
    let mut runner = runner(vm, json!({}), planner);
    runner.grounder = config.grounder.as_ref().map(|g| Grounder {
        dialect: g.code_style,
        model: Arc::new(grounder),
    });
    runner
}

#[tokio::test]
async fn click_then_finished_passes_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "");
    let task = task(json!([
        {"type": "stop", "key": "", "value": "DONE"},
        {"type": "value", "key": "zoom_level", "value": 5}
    ]));
    let vm = Arc::new(FakeVm::default());
    let model = ScriptedModel::new(
        &["Thought: zoom\nAction: click(start_box='(640,360)')"],
        "Thought: zoomed\nAction: finished()",
    );

    let verdict = runner(Arc::clone(&vm), json!({"zoom_level": 5}), model).run(&config, &task).await;

    assert!(verdict.initialized);
    assert!(verdict.report.passed, "{:?}", verdict.report.failure);
    assert_eq!(verdict.episode.termination(), Some(&Termination::Done));
    assert_eq!(verdict.episode.steps, 2);
    // reset command plus the launch step
    assert_eq!(vm.commands.lock().unwrap().len(), 2);
    let scripts = vm.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("pyautogui.click("));
}

#[tokio::test]
async fn wrong_state_fails_with_the_assertion_named() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "");
    let task = task(json!([{"type": "value", "key": "zoom_level", "value": 5}]));
    let model = ScriptedModel::new(&[], "Thought: done\nAction: finished()");

    let verdict = runner(Arc::new(FakeVm::default()), json!({"zoom_level": 2}), model)
        .run(&config, &task)
        .await;

    assert!(!verdict.report.passed);
    let failure = verdict.report.failure.unwrap();
    assert_eq!(failure.kind, "value");
    assert_eq!(failure.key, "zoom_level");
}

#[tokio::test]
async fn unparsable_replies_hit_the_failure_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "max_consecutive_failures = 2");
    let task = task(json!([{"type": "stop", "key": "", "value": "DONE"}]));
    let vm = Arc::new(FakeVm::default());
    let model = ScriptedModel::new(&[], "I am not sure what to do.");

    let verdict = runner(Arc::clone(&vm), json!({}), model).run(&config, &task).await;

    assert_eq!(verdict.episode.end, EndReason::FailureLimit);
    assert_eq!(verdict.episode.steps, 2);
    assert!(vm.scripts.lock().unwrap().is_empty());
    assert!(!verdict.report.passed);
}

#[tokio::test]
async fn step_budget_ends_the_episode() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "max_steps = 3");
    let task = task(json!([]));
    let model = ScriptedModel::new(&[], "Thought: keep looking\nAction: hotkey(key='ctrl l')");

    let verdict = runner(Arc::new(FakeVm::default()), json!({}), model).run(&config, &task).await;

    assert_eq!(verdict.episode.end, EndReason::StepLimit);
    assert_eq!(verdict.episode.steps, 3);
    assert_eq!(verdict.episode.termination(), None);
}

#[tokio::test]
async fn slow_model_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "");
    let task = task(json!([{"type": "stop", "key": "", "value": "TIMEOUT"}]));
    let mut settings = TaskRunner::settings(&config, &task);
    settings.model_timeout = Duration::from_millis(50);
    let mut model = ScriptedModel::new(&[], "Thought: t\nAction: finished()");
    model.delay = Duration::from_secs(5);

    let result = Episode::new(settings, Arc::new(FakeVm::default()), Arc::new(model)).run().await;

    assert_eq!(result.termination(), Some(&Termination::Timeout));
    assert_eq!(result.steps, 1);
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "");
    let task = task(json!([]));
    let vm = Arc::new(FakeVm::default());
    let episode = Episode::new(
        TaskRunner::settings(&config, &task),
        vm.clone(),
        Arc::new(ScriptedModel::new(&[], "Thought: t\nAction: finished()")),
    );
    episode.cancel_handle().store(true, Ordering::SeqCst);

    let result = episode.run().await;

    assert_eq!(result.end, EndReason::Cancelled);
    assert_eq!(result.steps, 0);
    assert!(vm.scripts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn session_history_is_written_to_the_configured_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "");
    let task = task(json!([]));
    let model = ScriptedModel::new(&[], "Thought: nothing to do\nAction: finished()");

    let verdict = runner(Arc::new(FakeVm::default()), json!({}), model).run(&config, &task).await;

    let path = dir.path().join(format!("session_{}.jsonl", verdict.episode.session_id));
    let text = std::fs::read_to_string(path).unwrap();
    let roles: Vec<String> = text
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["role"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(roles.first().map(String::as_str), Some("system"));
    assert!(roles.iter().any(|r| r == "assistant"));
    assert_eq!(roles.last().map(String::as_str), Some("end"));
}

#[tokio::test]
async fn planner_steps_are_grounded_then_executed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), "planner", GROUNDER_SECTION);
    let task = task(json!([{"type": "stop", "key": "", "value": "DONE"}]));
    let vm = Arc::new(FakeVm::default());
    let planner = ScriptedModel::new(&["Click the zoom button in the toolbar."], "```\nDONE\n```");
    let grounder = ScriptedModel::new(&["(500, 250)"], "no point here");

    let verdict = grounded_runner(Arc::clone(&vm), &config, planner, grounder)
        .run(&config, &task)
        .await;

    assert!(verdict.report.passed, "{:?}", verdict.report.failure);
    assert_eq!(verdict.episode.steps, 2);
    let scripts = vm.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    // 1280x720 screen, thousandths from the grounder
    assert!(scripts[0].contains("pyautogui.click(640, 180, button='left')"), "{}", scripts[0]);

    let path = dir.path().join(format!("session_{}.jsonl", verdict.episode.session_id));
    let text = std::fs::read_to_string(path).unwrap();
    assert_eq!(text.lines().filter(|l| l.contains(r#""role":"grounder""#)).count(), 1);
}

#[tokio::test]
async fn grounder_without_a_point_counts_as_a_failed_round() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), "planner", &format!("max_consecutive_failures = 2\n{GROUNDER_SECTION}"));
    let task = task(json!([]));
    let vm = Arc::new(FakeVm::default());
    let planner = ScriptedModel::new(&[], "Open the File menu.");
    let grounder = ScriptedModel::new(&[], "I cannot see a File menu.");

    let verdict = grounded_runner(Arc::clone(&vm), &config, planner, grounder)
        .run(&config, &task)
        .await;

    assert_eq!(verdict.episode.end, EndReason::FailureLimit);
    assert!(vm.scripts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn tags_from_the_vm_bind_to_their_centres() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), "antiquot", "set_of_marks = true");
    let task = task(json!([]));
    let vm = Arc::new(FakeVm {
        tags: Some(vec![
            Tag { x: 10, y: 10, width: 20, height: 20 },
            Tag { x: 600, y: 340, width: 80, height: 40 },
        ]),
        ..FakeVm::default()
    });
    let model = ScriptedModel::new(&["```\npyautogui.click(tag_2)\n```"], "```\nDONE\n```");

    let verdict = runner(Arc::clone(&vm), json!({}), model).run(&config, &task).await;

    assert_eq!(verdict.episode.termination(), Some(&Termination::Done));
    let scripts = vm.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].starts_with("tag_1=(20, 20)\ntag_2=(640, 360)\n"), "{}", scripts[0]);
    assert!(scripts[0].ends_with("pyautogui.click(tag_2)"));
}

#[tokio::test]
async fn cancelling_mid_batch_stops_before_the_next_action() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "");
    let task = task(json!([]));
    let vm = Arc::new(FakeVm::default());
    let model = ScriptedModel::new(
        &[],
        "Thought: open then save\nAction: click(start_box='(640,360)')\n\nhotkey(key='ctrl s')",
    );
    let episode = Episode::new(TaskRunner::settings(&config, &task), vm.clone(), Arc::new(model));
    *vm.cancel_on_script.lock().unwrap() = Some(episode.cancel_handle());

    let result = episode.run().await;

    assert_eq!(result.end, EndReason::Cancelled);
    assert_eq!(result.steps, 1);
    let scripts = vm.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("pyautogui.click("));
}
