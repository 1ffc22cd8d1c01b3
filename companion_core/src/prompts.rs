use std::path::PathBuf;

use crate::collaborators::PromptLoader;

/// Built-in character that needs no prompt file.
pub const DEFAULT_CHARACTER: &str = "Default AI Assistant";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";
pub const DEFAULT_DISPLAY_NAME: &str = "AI";

/// Reads `<dir>/<character>.txt` prompt files.
pub struct FilePromptLoader {
    dir: PathBuf,
}

impl FilePromptLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Ids name a file inside the prompt directory, never a path.
fn is_plain_id(character: &str) -> bool {
    !character.trim().is_empty()
        && !character.contains(|c| c == '/' || c == '\\')
        && !character.contains("..")
}

impl PromptLoader for FilePromptLoader {
    fn load(&self, character: &str) -> Option<String> {
        if !is_plain_id(character) {
            tracing::warn!("Rejected character id '{}'", character);
            return None;
        }
        let path = self.dir.join(format!("{}.txt", character));
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(e) => {
                tracing::warn!("Failed to read character prompt {}: {}", path.display(), e);
                None
            }
        }
    }

    fn list_characters(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_suffix(".txt").map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }
}

/// A resolved character: the id it was selected by, the name shown to the
/// user, and the prompt that seeds the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterProfile {
    pub id: String,
    pub display_name: String,
    pub system_prompt: String,
}

impl CharacterProfile {
    pub fn default_assistant() -> Self {
        Self::default_assistant_with(DEFAULT_SYSTEM_PROMPT)
    }

    /// The built-in assistant seeded with `system_prompt`; blank text keeps
    /// the stock prompt.
    pub fn default_assistant_with(system_prompt: &str) -> Self {
        let system_prompt = match system_prompt.trim() {
            "" => DEFAULT_SYSTEM_PROMPT,
            trimmed => trimmed,
        };
        Self {
            id: DEFAULT_CHARACTER.to_string(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            system_prompt: system_prompt.to_string(),
        }
    }

    /// Resolve `id` through `loader`. The built-in assistant uses
    /// `default_prompt`. `None` when a non-default character has no usable
    /// prompt.
    pub fn resolve(id: &str, loader: &dyn PromptLoader, default_prompt: &str) -> Option<Self> {
        if id == DEFAULT_CHARACTER {
            return Some(Self::default_assistant_with(default_prompt));
        }
        let system_prompt = loader.load(id)?;
        Some(Self {
            id: id.to_string(),
            display_name: derive_display_name(id, &system_prompt),
            system_prompt,
        })
    }
}

/// `"You are Nova, a ..."` on the first line gives `Nova`; otherwise the id
/// with its first letter upper-cased and the rest lower-cased.
pub fn derive_display_name(id: &str, prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default();
    if let Some(rest) = first_line.strip_prefix("You are ") {
        let name = rest.split(',').next().unwrap_or_default().trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    capitalize(id)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_from_first_line() {
        assert_eq!(
            derive_display_name("nova", "You are Nova, a curious astronomer.\nBe kind."),
            "Nova"
        );
        assert_eq!(derive_display_name("nova", "You are Nova.\nMore."), "Nova.");
        assert_eq!(derive_display_name("sHERLOCK", "Detective persona."), "Sherlock");
        assert_eq!(derive_display_name("bot", "You are , oops"), "Bot");
    }

    #[test]
    fn file_loader_reads_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nova.txt"), "\n  You are Nova, a guide.  \n").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "   ").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        let loader = FilePromptLoader::new(dir.path());

        assert_eq!(loader.load("nova").as_deref(), Some("You are Nova, a guide."));
        assert_eq!(loader.load("empty"), None);
        assert_eq!(loader.load("missing"), None);
        assert_eq!(loader.list_characters(), vec!["empty", "nova"]);
    }

    #[test]
    fn resolve_handles_default_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("orion.txt"), "A hunter of stars.").unwrap();
        let loader = FilePromptLoader::new(dir.path());

        assert_eq!(
            CharacterProfile::resolve(DEFAULT_CHARACTER, &loader, DEFAULT_SYSTEM_PROMPT),
            Some(CharacterProfile::default_assistant())
        );
        let custom = CharacterProfile::resolve(DEFAULT_CHARACTER, &loader, "Be brief.").unwrap();
        assert_eq!(custom.system_prompt, "Be brief.");
        assert_eq!(custom.display_name, DEFAULT_DISPLAY_NAME);

        let orion = CharacterProfile::resolve("orion", &loader, DEFAULT_SYSTEM_PROMPT).unwrap();
        assert_eq!(orion.display_name, "Orion");
        assert_eq!(orion.system_prompt, "A hunter of stars.");
        assert!(CharacterProfile::resolve("ghost", &loader, DEFAULT_SYSTEM_PROMPT).is_none());
    }

    #[test]
    fn blank_default_prompt_keeps_stock_text() {
        assert_eq!(
            CharacterProfile::default_assistant_with("  "),
            CharacterProfile::default_assistant()
        );
    }

    #[test]
    fn ids_cannot_leave_prompt_directory() {
        let root = tempfile::tempdir().unwrap();
        let characters = root.path().join("characters");
        std::fs::create_dir_all(&characters).unwrap();
        std::fs::write(root.path().join("secret.txt"), "outside").unwrap();
        let loader = FilePromptLoader::new(&characters);

        assert_eq!(loader.load("../secret"), None);
        assert_eq!(loader.load("..\\secret"), None);
        assert_eq!(loader.load("sub/secret"), None);
        assert!(CharacterProfile::resolve("../secret", &loader, DEFAULT_SYSTEM_PROMPT).is_none());
    }
}
