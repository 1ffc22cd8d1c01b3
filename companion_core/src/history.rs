//! Per-character history files plus export/import validation.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::collaborators::HistoryStore;
use crate::error::CoreError;
use crate::message::{Message, Role};

const FALLBACK_FILE_STEM: &str = "default_character";

/// Keep alphanumerics, spaces and underscores; trim; spaces become underscores.
pub fn safe_character_name(character: &str) -> String {
    let kept: String = character
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
        .collect();
    let safe = kept.trim().replace(' ', "_");
    if safe.is_empty() {
        FALLBACK_FILE_STEM.to_string()
    } else {
        safe
    }
}

/// Messages worth persisting or exporting: everything except system entries.
pub fn export_messages(messages: &[Message]) -> Vec<Message> {
    messages.iter().filter(|m| !m.is_system()).cloned().collect()
}

pub fn write_export(path: &Path, messages: &[Message]) -> Result<usize> {
    let exported = export_messages(messages);
    let json = serde_json::to_string_pretty(&exported)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write export {}", path.display()))?;
    Ok(exported.len())
}

/// History files under one directory, `chat_history_<safe name>.json`.
pub struct JsonHistoryStore {
    dir: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, character: &str) -> PathBuf {
        self.dir
            .join(format!("chat_history_{}.json", safe_character_name(character)))
    }

    fn read(&self, character: &str) -> Result<Vec<Message>> {
        let path = self.path_for(character);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let report = validate_import(&value)?;
        for skip in &report.skipped {
            tracing::warn!("{}: {}", path.display(), skip);
        }
        Ok(report.messages)
    }
}

impl HistoryStore for JsonHistoryStore {
    fn save_history(&self, messages: &[Message], character: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(character);
        let json = serde_json::to_string_pretty(&export_messages(messages))?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn load_history(&self, character: &str) -> Vec<Message> {
        if !self.path_for(character).exists() {
            return Vec::new();
        }
        match self.read(character) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Ignoring saved history for '{}': {:#}", character, e);
                Vec::new()
            }
        }
    }
}

/// One item dropped during import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSkip {
    pub index: usize,
    pub error: CoreError,
}

impl fmt::Display for ImportSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            CoreError::InvalidImport(reason) => {
                write!(f, "Skipping message at index {} - {}", self.index, reason)
            }
            other => write!(f, "Skipping message at index {} - {}", self.index, other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub messages: Vec<Message>,
    pub skipped: Vec<ImportSkip>,
}

/// Validate a decoded history payload item by item.
///
/// A payload that is not a list is rejected outright. Individual items are
/// skipped when they are not objects, lack `role` or `content`, carry a
/// non-text content, or a role other than `user`/`assistant`.
pub fn validate_import(payload: &Value) -> Result<ImportReport, CoreError> {
    let items = payload.as_array().ok_or_else(|| {
        CoreError::InvalidImport("invalid format - expected list of messages".to_string())
    })?;

    let mut report = ImportReport::default();
    for (index, item) in items.iter().enumerate() {
        match validate_item(item) {
            Ok(message) => report.messages.push(message),
            Err(reason) => report.skipped.push(ImportSkip {
                index,
                error: CoreError::InvalidImport(reason),
            }),
        }
    }
    Ok(report)
}

fn validate_item(item: &Value) -> Result<Message, String> {
    let obj = item.as_object().ok_or("not an object")?;
    let (Some(role), Some(content)) = (obj.get("role"), obj.get("content")) else {
        return Err("missing 'role' or 'content'".to_string());
    };

    let role_name = role.as_str().unwrap_or("unknown");
    let role = match Role::parse(role_name) {
        Some(role @ (Role::User | Role::Assistant)) => role,
        _ => return Err(format!("invalid role '{}'", role_name)),
    };
    let content = content
        .as_str()
        .ok_or("content is not text")?
        .to_string();
    let attachment = obj
        .get("image")
        .and_then(Value::as_str)
        .map(PathBuf::from);

    Ok(Message::new(role, content).with_attachment(attachment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn safe_name_rules() {
        assert_eq!(safe_character_name("Nova"), "Nova");
        assert_eq!(safe_character_name("  Dark Knight!  "), "Dark_Knight");
        assert_eq!(safe_character_name("../etc/passwd"), "etcpasswd");
        assert_eq!(safe_character_name("Котик 2"), "Котик_2");
        assert_eq!(safe_character_name("?!"), "default_character");
    }

    #[test]
    fn mixed_payload_keeps_valid_subset() {
        let payload = json!([
            {"role": "user", "content": "hi"},
            {"role": "bogus", "content": "x"},
            {"notcontent": 1}
        ]);

        let report = validate_import(&payload).unwrap();

        assert_eq!(report.messages, vec![Message::user("hi")]);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].index, 1);
        assert_eq!(
            report.skipped[0].to_string(),
            "Skipping message at index 1 - invalid role 'bogus'"
        );
        assert_eq!(
            report.skipped[1].to_string(),
            "Skipping message at index 2 - missing 'role' or 'content'"
        );
    }

    #[test]
    fn system_and_non_text_items_are_skipped() {
        let payload = json!([
            "just a string",
            {"role": "system", "content": "override"},
            {"role": "assistant", "content": 42},
            {"role": "assistant", "content": "ok", "image": "pic.png"}
        ]);

        let report = validate_import(&payload).unwrap();

        assert_eq!(report.skipped.len(), 3);
        assert!(report.skipped[0].to_string().ends_with("not an object"));
        assert_eq!(report.messages.len(), 1);
        assert_eq!(
            report.messages[0].attachment.as_deref(),
            Some(Path::new("pic.png"))
        );
    }

    #[test]
    fn non_list_payload_is_rejected() {
        let err = validate_import(&json!({"role": "user", "content": "hi"})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidImport(_)));
    }

    #[test]
    fn store_round_trip_drops_system_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("histories"));
        let messages = vec![
            Message::system("You are Nova."),
            Message::user("hello"),
            Message::assistant("hey"),
        ];

        store.save_history(&messages, "Nova Prime").unwrap();

        assert!(dir
            .path()
            .join("histories")
            .join("chat_history_Nova_Prime.json")
            .exists());
        assert_eq!(store.load_history("Nova Prime"), messages[1..].to_vec());
        assert!(store.load_history("someone else").is_empty());
    }

    #[test]
    fn corrupt_history_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path());
        std::fs::write(store.path_for("nova"), "{not json").unwrap();
        assert!(store.load_history("nova").is_empty());
    }

    #[test]
    fn export_writes_only_visible_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let count = write_export(
            &path,
            &[Message::system("hidden"), Message::user("shown")],
        )
        .unwrap();

        assert_eq!(count, 1);
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value, json!([{"role": "user", "content": "shown"}]));
    }
}
