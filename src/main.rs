use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use scibench::agent_engine::Grounder;
use scibench::config::load_config;
use scibench::controller::{HttpAppController, HttpVmController, VmController};
use scibench::errors::HarnessResult;
use scibench::llm::OpenAiCompatibleClient;
use scibench::task::{TaskConfig, TaskRunner, Verdict};

const USAGE: &str = "usage: scibench <task.json> [config.toml]";

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    scibench::init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(task_path) = args.next().map(PathBuf::from) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    let config_path = args.next().map(PathBuf::from);

    match run(task_path, config_path).await {
        Ok(verdict) => {
            match serde_json::to_string_pretty(&verdict) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::error!(error = %e, "verdict serialization failed"),
            }
            if verdict.report.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "task could not run");
            ExitCode::from(2)
        }
    }
}

async fn run(task_path: PathBuf, config_path: Option<PathBuf>) -> HarnessResult<Verdict> {
    let config = load_config(config_path.as_deref())?;
    let task = TaskConfig::load(&task_path)?;

    let vm: Arc<dyn VmController> = Arc::new(HttpVmController::new(
        &config.vm.ip,
        config.app.port,
        config.vm.request_timeout_secs,
    )?);
    let app = HttpAppController::new(task.app, Arc::clone(&vm), config.app.port, config.vm.request_timeout_secs)?;
    let model = OpenAiCompatibleClient::new(
        config.model.id.clone(),
        config.model.client_config(),
        config.model.api_key(),
    );
    let grounder = config.grounder.as_ref().map(|g| Grounder {
        dialect: g.code_style,
        model: Arc::new(OpenAiCompatibleClient::new(
            g.model.id.clone(),
            g.model.client_config(),
            g.api_key(),
        )),
    });

    let runner = TaskRunner {
        vm,
        app: Arc::new(app),
        model: Arc::new(model),
        grounder,
    };
    Ok(runner.run(&config, &task).await)
}
