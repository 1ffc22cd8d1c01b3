use anyhow::{Context, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::collaborators::ChatLog;

pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Append-only transcript file with `[timestamp] ROLE: text` lines.
pub struct FileChatLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileChatLog {
    /// Open the log, writing an initialization line when the file is new.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let log = Self {
            path,
            write_lock: Mutex::new(()),
        };
        if !log.path.exists() {
            log.append_line(&format!("[{}] LOG: Chat log initialized.", timestamp_now()))?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `max_chars` characters of the log.
    pub fn view_tail(&self, max_chars: usize) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let total = text.chars().count();
        Ok(text.chars().skip(total.saturating_sub(max_chars)).collect())
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("Chat log lock poisoned: {}", e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

impl ChatLog for FileChatLog {
    fn record(&self, timestamp: &str, role: &str, text: &str) -> Result<()> {
        self.append_line(&format!("[{}] {}: {}", timestamp, role.to_uppercase(), text))
    }
}
