use async_trait::async_trait;
use serde_json::json;

use crate::controller::http::{HttpTransport, RequestSpec, SERVER_PORT};
use crate::controller::{Command, VmController};
use crate::errors::{HarnessError, HarnessResult};
use crate::perception::marks::{tags_from_accessibility_tree, Tag};

/// Talks to the control server on [`SERVER_PORT`] inside the VM.
pub struct HttpVmController {
    transport: HttpTransport,
    /// Substituted for `«PORTLIKE»` in setup commands.
    app_port: u16,
}

impl HttpVmController {
    pub fn new(vm_ip: &str, app_port: u16, timeout_secs: u64) -> HarnessResult<Self> {
        Ok(Self {
            transport: HttpTransport::new(vm_ip, SERVER_PORT, timeout_secs)?,
            app_port,
        })
    }

    async fn run(&self, query: &str, command: &Command, shell: bool) -> bool {
        let command = command.fill_port(self.app_port);
        let spec = match query.parse::<RequestSpec>() {
            Ok(spec) => spec.json(json!({ "command": command, "shell": shell })),
            Err(e) => {
                tracing::error!(query, "{e}");
                return false;
            }
        };
        match self.transport.send(&spec).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(query, command = ?command, "Failed when requesting: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl VmController for HttpVmController {
    fn vm_ip(&self) -> &str {
        self.transport.host()
    }

    async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        let spec: RequestSpec = "GET/screenshot".parse()?;
        Ok(self.transport.send(&spec).await?.body)
    }

    async fn execute(&self, command: &Command, shell: bool) -> bool {
        self.run("POST/setup/execute", command, shell).await
    }

    async fn launch(&self, command: &Command, shell: bool) -> bool {
        self.run("POST/setup/launch", command, shell).await
    }

    async fn execute_python(&self, script: &str) -> bool {
        let argv = Command::Argv(vec!["python3".into(), "-c".into(), script.to_string()]);
        self.run("POST/execute", &argv, false).await
    }

    async fn set_of_marks(&self) -> HarnessResult<Option<Vec<Tag>>> {
        let spec: RequestSpec = "GET/accessibility".parse()?;
        let reply = self.transport.send(&spec).await?.json()?;
        let tree = reply
            .get("AT")
            .and_then(|t| t.as_str())
            .ok_or_else(|| HarnessError::Controller("accessibility reply has no tree".into()))?;
        let tags = tags_from_accessibility_tree(tree);
        tracing::debug!(tags = tags.len(), "set-of-marks tags retrieved");
        Ok(Some(tags))
    }

    async fn read_file(&self, path: &str) -> HarnessResult<Vec<u8>> {
        let spec = "POST/file".parse::<RequestSpec>()?.form(&[("file_path", path)]);
        Ok(self.transport.send(&spec).await?.body)
    }
}
