//! System prompt construction.
//!
//! The prompt is layered from optional markdown files:
//!
//! 1. **Soul** - `~/.rosiwit/SOUL.md` (persona, tone)
//! 2. **Rules** - `~/.rosiwit/RULE.md` (behavioral constraints)
//! 3. **Task** - optional context supplied by the caller
//!
//! Present sections are joined with a `---` separator. Missing or blank
//! files are skipped. An override in config replaces everything, and an
//! empty result falls back to a built-in prompt.

use std::path::{Path, PathBuf};

use rosiwit_config::IdentityConfig;
use tracing::debug;

/// Separator placed between prompt sections.
pub const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// A resolved system prompt plus the files it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPrompt {
    pub text: String,
    pub loaded_files: Vec<PathBuf>,
}

/// Where the prompt layers come from.
#[derive(Debug, Clone, Default)]
pub struct PromptSources {
    pub soul_file: Option<PathBuf>,
    pub rules_file: Option<PathBuf>,
    pub system_prompt_override: Option<String>,
}

impl From<&IdentityConfig> for PromptSources {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            soul_file: Some(config.soul_path()),
            rules_file: Some(config.rules_path()),
            system_prompt_override: config.system_prompt_override.clone(),
        }
    }
}

impl SystemPrompt {
    /// Build the prompt, appending `task` as the last section when given.
    pub fn load(sources: &PromptSources, task: Option<&str>) -> Self {
        if let Some(override_prompt) = &sources.system_prompt_override {
            debug!("Using system prompt override, skipping file loading");
            return Self {
                text: override_prompt.clone(),
                loaded_files: vec![],
            };
        }

        let mut sections = Vec::new();
        let mut loaded_files = Vec::new();

        let layers = [
            (&sources.soul_file, "## Soul"),
            (&sources.rules_file, "## Rules"),
        ];
        for (path, heading) in layers {
            let Some(path) = path else { continue };
            if let Some(content) = read_section(path) {
                debug!(file = %path.display(), "Loaded prompt file");
                sections.push(format!("{heading}\n\n{content}"));
                loaded_files.push(path.clone());
            }
        }

        if let Some(task) = task.map(str::trim).filter(|t| !t.is_empty()) {
            sections.push(format!("## Current Task\n\n{task}"));
        }

        if sections.is_empty() {
            debug!("No prompt files found, using fallback system prompt");
            return Self {
                text: Self::fallback(),
                loaded_files,
            };
        }

        Self {
            text: sections.join(SECTION_SEPARATOR),
            loaded_files,
        }
    }

    /// The built-in prompt used when nothing else is configured.
    pub fn fallback() -> String {
        concat!(
            "You are Rosiwit, a helpful AI assistant. ",
            "You can call tools provided by connected MCP servers. ",
            "Use them when they help accomplish the user's goal, ",
            "and be concise and accurate.",
        )
        .into()
    }
}

/// Read a prompt file, returning None if it is missing, unreadable or blank.
fn read_section(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sources(dir: &Path) -> PromptSources {
        PromptSources {
            soul_file: Some(dir.join("SOUL.md")),
            rules_file: Some(dir.join("RULE.md")),
            system_prompt_override: None,
        }
    }

    #[test]
    fn no_files_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let prompt = SystemPrompt::load(&sources(tmp.path()), None);
        assert_eq!(prompt.text, SystemPrompt::fallback());
        assert!(prompt.loaded_files.is_empty());
    }

    #[test]
    fn soul_rules_and_task_are_joined_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("SOUL.md"), "Be kind.\n").unwrap();
        fs::write(tmp.path().join("RULE.md"), "Never guess.").unwrap();

        let prompt = SystemPrompt::load(&sources(tmp.path()), Some("Summarize logs"));
        let parts: Vec<&str> = prompt.text.split(SECTION_SEPARATOR).collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].ends_with("Be kind."));
        assert!(parts[1].ends_with("Never guess."));
        assert!(parts[2].ends_with("Summarize logs"));
        assert_eq!(prompt.loaded_files.len(), 2);
    }

    #[test]
    fn missing_and_blank_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("RULE.md"), "   \n").unwrap();
        fs::write(tmp.path().join("SOUL.md"), "Persona").unwrap();

        let prompt = SystemPrompt::load(&sources(tmp.path()), None);
        assert!(!prompt.text.contains(SECTION_SEPARATOR));
        assert!(prompt.text.contains("Persona"));
    }

    #[test]
    fn task_alone_is_enough() {
        let tmp = tempfile::tempdir().unwrap();
        let prompt = SystemPrompt::load(&sources(tmp.path()), Some("Do the thing"));
        assert_eq!(prompt.text, "## Current Task\n\nDo the thing");
    }

    #[test]
    fn override_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("SOUL.md"), "Persona").unwrap();
        let mut src = sources(tmp.path());
        src.system_prompt_override = Some("Custom prompt".into());

        let prompt = SystemPrompt::load(&src, Some("ignored"));
        assert_eq!(prompt.text, "Custom prompt");
    }

    #[test]
    fn sources_follow_identity_config() {
        let config = IdentityConfig {
            soul_file: Some(PathBuf::from("/tmp/soul.md")),
            rules_file: None,
            system_prompt_override: None,
        };
        let src = PromptSources::from(&config);
        assert_eq!(src.soul_file.as_deref(), Some(Path::new("/tmp/soul.md")));
        assert!(src.rules_file.unwrap().ends_with("RULE.md"));
    }
}
