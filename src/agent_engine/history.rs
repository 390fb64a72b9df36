use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::HarnessResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub step: u32,
    pub role: String,
    pub content: Option<String>,
    pub action: Option<serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(step: u32, role: &str) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            step,
            role: role.to_string(),
            content: None,
            action: None,
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn action(mut self, action: serde_json::Value) -> Self {
        self.action = Some(action);
        self
    }
}

pub struct SessionHistory {
    pub session_id: String,
    entries: Vec<HistoryEntry>,
    file_path: PathBuf,
}

impl SessionHistory {
    /// `dir` overrides the platform data directory.
    pub fn new(dir: Option<&Path>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = match dir {
            Some(d) => {
                let _ = std::fs::create_dir_all(d);
                d.to_path_buf()
            }
            None => data_dir_or_cwd(),
        };
        let file_path = dir.join(format!("session_{session_id}.jsonl"));
        Self {
            session_id,
            entries: Vec::new(),
            file_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Records the entry and appends it to the JSONL file.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "history flush failed");
        }
    }

    /// Append the latest entry to the JSONL file.
    pub fn flush(&self) -> HarnessResult<()> {
        if let Some(last) = self.entries.last() {
            let line = serde_json::to_string(last)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            writeln!(file, "{}", line)?;
            tracing::debug!(
                path = %self.file_path.display(),
                "history entry flushed"
            );
        }
        Ok(())
    }
}

/// `<data dir>/scibench/sessions`, falling back to the working directory.
fn data_dir_or_cwd() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        let d = data_dir.join("scibench").join("sessions");
        if std::fs::create_dir_all(&d).is_ok() {
            return d;
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = SessionHistory::new(Some(dir.path()));
        history.record(HistoryEntry::new(1, "assistant").content("Action: wait()"));
        history.record(HistoryEntry::new(1, "executor").action(serde_json::json!({"ok": true})));

        let text = std::fs::read_to_string(history.path()).unwrap();
        let lines: Vec<HistoryEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].content.as_deref(), Some("Action: wait()"));
        assert_eq!(lines[1].role, "executor");
        assert!(history.path().file_name().unwrap().to_string_lossy().contains(&history.session_id));
    }
}
