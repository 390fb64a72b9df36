use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::controller::http::{HttpTransport, RequestSpec, SERVER_PORT};
use crate::controller::{AppController, VmController};
use crate::errors::{HarnessError, HarnessResult};

/// Applications with a status server, keyed by the task's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AppKind {
    Celestia,
    ChimeraX,
    GrassGis,
    KAlgebra,
    TeXstudio,
}

impl AppKind {
    pub const ALL: [AppKind; 5] = [
        Self::Celestia,
        Self::ChimeraX,
        Self::GrassGis,
        Self::KAlgebra,
        Self::TeXstudio,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Celestia => "Celestia",
            Self::ChimeraX => "ChimeraX",
            Self::GrassGis => "GrassGIS",
            Self::KAlgebra => "KAlgebra",
            Self::TeXstudio => "TeXstudio",
        }
    }

    /// Where the state dump lives. `None` for apps without an HTTP dump;
    /// ChimeraX writes its states through the command channel instead.
    fn dump_request(&self, query: &Value) -> HarnessResult<Option<RequestSpec>> {
        Ok(match self {
            Self::Celestia => Some("POST/dump".parse::<RequestSpec>()?.raw(query.to_string())),
            Self::GrassGis => Some("GET/dump".parse()?),
            Self::KAlgebra => Some("GET/vars".parse()?),
            Self::ChimeraX | Self::TeXstudio => None,
        })
    }

    fn has_command_channel(&self) -> bool {
        matches!(self, Self::ChimeraX | Self::TeXstudio)
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AppKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| HarnessError::Config(format!("unknown application type: {s}")))
    }
}

impl TryFrom<String> for AppKind {
    type Error = HarnessError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AppKind> for String {
    fn from(k: AppKind) -> Self {
        k.name().to_string()
    }
}

/// Log lines and success flag from a ChimeraX run reply.
fn parse_run_reply(reply: &Value) -> (Vec<String>, bool) {
    let notes = reply
        .get("log messages")
        .and_then(|m| m.get("note"))
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .map(|l| l.as_str().map(str::to_string).unwrap_or_else(|| l.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let ok = reply.get("error").map_or(true, Value::is_null);
    (notes, ok)
}

/// Guest directory ChimeraX writes its state files to.
pub const STATES_DIR: &str = "/home/user/Downloads";

/// Has ChimeraX write its states to `STATES_DIR/<stamp>.json` and reads the
/// file back from the VM.
pub async fn states_dump(app: &dyn AppController, vm: &dyn VmController, stamp: i64) -> HarnessResult<Value> {
    let (_, ok) = app.call(&format!("states {STATES_DIR} {stamp}")).await?;
    if !ok {
        return Err(HarnessError::Controller(format!("{} could not write its states", app.kind())));
    }
    let path = format!("{STATES_DIR}/{stamp}.json");
    let bytes = vm.read_file(&path).await?;
    let state = serde_json::from_slice(&bytes)?;
    tracing::debug!(app = %app.kind(), path = %path, "states read back");
    Ok(state)
}

/// Application status server reached through the VM's address.
pub struct HttpAppController {
    kind: AppKind,
    transport: HttpTransport,
    /// Reads back files the application writes.
    vm: Arc<dyn VmController>,
}

impl HttpAppController {
    pub fn new(kind: AppKind, vm: Arc<dyn VmController>, app_port: u16, timeout_secs: u64) -> HarnessResult<Self> {
        Ok(Self {
            kind,
            transport: HttpTransport::new(vm.vm_ip(), app_port, timeout_secs)?,
            vm,
        })
    }
}

#[async_trait]
impl AppController for HttpAppController {
    fn kind(&self) -> AppKind {
        self.kind
    }

    async fn status_dump(&self, query: &Value) -> HarnessResult<Value> {
        if self.kind == AppKind::ChimeraX {
            let stamp = chrono::Utc::now().timestamp_millis();
            return states_dump(self, self.vm.as_ref(), stamp).await;
        }
        let spec = self.kind.dump_request(query)?.ok_or_else(|| {
            HarnessError::Controller(format!("{} has no status dump", self.kind))
        })?;
        let state = self.transport.send(&spec).await?.json()?;
        tracing::debug!(app = %self.kind, "status dumped");
        Ok(state)
    }

    async fn call(&self, command: &str) -> HarnessResult<(Vec<String>, bool)> {
        if !self.kind.has_command_channel() {
            return Err(HarnessError::Controller(format!("{} has no command channel", self.kind)));
        }
        let spec = format!("POST:{SERVER_PORT}/chimerax/run")
            .parse::<RequestSpec>()?
            .json(json!({ "command": command }))
            .tolerate_embedded_error();
        let reply = self.transport.send(&spec).await?.json()?;
        let (notes, ok) = parse_run_reply(&reply);
        if !ok {
            tracing::warn!(app = %self.kind, command, error = %reply["error"], "command failed");
        }
        Ok((notes, ok))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::controller::Command;

    /// Answers every call with `ok` and remembers the commands.
    struct Channel {
        ok: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AppController for Channel {
        fn kind(&self) -> AppKind {
            AppKind::ChimeraX
        }

        async fn status_dump(&self, _query: &Value) -> HarnessResult<Value> {
            Ok(Value::Null)
        }

        async fn call(&self, command: &str) -> HarnessResult<(Vec<String>, bool)> {
            self.calls.lock().unwrap().push(command.to_string());
            Ok((Vec::new(), self.ok))
        }
    }

    /// Serves one file and records what was read.
    #[derive(Default)]
    struct Files {
        reads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VmController for Files {
        fn vm_ip(&self) -> &str {
            "127.0.0.1"
        }

        async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn execute(&self, _command: &Command, _shell: bool) -> bool {
            true
        }

        async fn launch(&self, _command: &Command, _shell: bool) -> bool {
            true
        }

        async fn execute_python(&self, _script: &str) -> bool {
            true
        }

        async fn read_file(&self, path: &str) -> HarnessResult<Vec<u8>> {
            self.reads.lock().unwrap().push(path.to_string());
            Ok(br#"{"models": [{"name": "1abc"}], "cartoon": true}"#.to_vec())
        }
    }

    #[test]
    fn task_types_resolve() {
        assert_eq!("GrassGIS".parse::<AppKind>().unwrap(), AppKind::GrassGis);
        assert!(matches!("Blender".parse::<AppKind>(), Err(HarnessError::Config(_))));
        let kind: AppKind = serde_json::from_str("\"KAlgebra\"").unwrap();
        assert_eq!(kind, AppKind::KAlgebra);
    }

    #[test]
    fn dump_requests_per_app() {
        let q = json!(["zoom_level"]);
        let celestia = AppKind::Celestia.dump_request(&q).unwrap().unwrap();
        assert_eq!(celestia.path, "/dump");
        assert_eq!(celestia.payload, crate::controller::http::Payload::Raw("[\"zoom_level\"]".into()));
        assert_eq!(AppKind::KAlgebra.dump_request(&q).unwrap().unwrap().path, "/vars");
        assert!(AppKind::ChimeraX.dump_request(&q).unwrap().is_none());
    }

    #[test]
    fn run_replies_split_logs_and_status() {
        let ok = json!({"log messages": {"note": ["opened 1abc"]}, "error": null});
        assert_eq!(parse_run_reply(&ok), (vec!["opened 1abc".to_string()], true));
        let bad = json!({"log messages": {"note": []}, "error": {"type": "UserError"}});
        assert_eq!(parse_run_reply(&bad), (vec![], false));
    }

    #[tokio::test]
    async fn apps_without_channel_reject_calls() {
        let app = HttpAppController::new(AppKind::Celestia, Arc::new(Files::default()), 8000, 1).unwrap();
        assert!(app.call("open x").await.is_err());
    }

    #[tokio::test]
    async fn chimerax_states_are_written_then_read_back() {
        let app = Channel { ok: true, calls: Mutex::new(Vec::new()) };
        let vm = Files::default();

        let state = states_dump(&app, &vm, 1700000000123).await.unwrap();

        assert_eq!(state["models"][0]["name"], "1abc");
        assert_eq!(*app.calls.lock().unwrap(), vec!["states /home/user/Downloads 1700000000123"]);
        assert_eq!(*vm.reads.lock().unwrap(), vec!["/home/user/Downloads/1700000000123.json"]);
    }

    #[tokio::test]
    async fn failed_states_command_reads_nothing() {
        let app = Channel { ok: false, calls: Mutex::new(Vec::new()) };
        let vm = Files::default();

        assert!(states_dump(&app, &vm, 1).await.is_err());
        assert!(vm.reads.lock().unwrap().is_empty());
    }
}
