//! Seams to the virtual machine and the application running inside it.

pub mod app;
pub mod http;
pub mod vm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};
use crate::perception::marks::Tag;

pub use app::{states_dump, AppKind, HttpAppController, STATES_DIR};
pub use vm::HttpVmController;

/// Replaced by the application's port in setup commands.
pub const PORT_PLACEHOLDER: &str = "«PORTLIKE»";

/// A setup command: one shell line or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Argv(Vec<String>),
}

impl Command {
    pub fn fill_port(&self, port: u16) -> Self {
        let fill = |s: &str| s.replace(PORT_PLACEHOLDER, &port.to_string());
        match self {
            Self::Line(line) => Self::Line(fill(line)),
            Self::Argv(argv) => Self::Argv(argv.iter().map(|a| fill(a)).collect()),
        }
    }
}

/// The VM's control server.
#[async_trait]
pub trait VmController: Send + Sync {
    fn vm_ip(&self) -> &str;

    async fn screenshot(&self) -> HarnessResult<Vec<u8>>;

    /// Runs a setup command and waits for it. Failures are logged and
    /// reported as `false`.
    async fn execute(&self, command: &Command, shell: bool) -> bool;

    /// Starts a process without waiting for it.
    async fn launch(&self, command: &Command, shell: bool) -> bool;

    /// Runs a python script (rendered device operations) inside the VM.
    async fn execute_python(&self, script: &str) -> bool;

    /// Tagged element boxes for set-of-marks observation. `None` when the
    /// VM does not provide them.
    async fn set_of_marks(&self) -> HarnessResult<Option<Vec<Tag>>> {
        Ok(None)
    }

    /// Contents of a file inside the VM.
    async fn read_file(&self, path: &str) -> HarnessResult<Vec<u8>> {
        Err(HarnessError::Controller(format!("{} cannot read {path}", self.vm_ip())))
    }
}

/// The application under test.
#[async_trait]
pub trait AppController: Send + Sync {
    fn kind(&self) -> AppKind;

    /// Structured state used by the evaluator.
    async fn status_dump(&self, query: &Value) -> HarnessResult<Value>;

    /// Runs one command in the application's own command channel. Returns
    /// its log lines and whether it succeeded.
    async fn call(&self, command: &str) -> HarnessResult<(Vec<String>, bool)> {
        Err(HarnessError::Controller(format!(
            "{} has no command channel (tried: {command})",
            self.kind()
        )))
    }
}
