use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::AppConfig;

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";
pub const DEFAULT_ANNOTATE: &str = "annotate.txt";

#[derive(Clone, Debug)]
pub struct PromptSet {
    pub annotate: String,
}

impl PromptSet {
    pub fn load(config_path: &Path, cfg: &AppConfig) -> anyhow::Result<Self> {
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let rel = cfg
            .prompts
            .annotate
            .clone()
            .unwrap_or_else(|| format!("{DEFAULT_PROMPTS_DIR}/{DEFAULT_ANNOTATE}"));
        let mut path = PathBuf::from(rel);
        if path.is_relative() {
            path = config_dir.join(&path);
        }
        if !path.exists() {
            return Err(anyhow!(
                "annotate prompt file not found: {} (run: glossworks --init-config)",
                path.display()
            ));
        }
        let annotate = std::fs::read_to_string(&path)
            .with_context(|| format!("read prompt: {}", path.display()))?;
        if annotate.trim().is_empty() {
            return Err(anyhow!("annotate prompt file is empty: {}", path.display()));
        }
        Ok(Self { annotate })
    }

    /// The embedded default, used when no config/prompt files exist on disk.
    pub fn builtin() -> Self {
        Self {
            annotate: DEFAULT_ANNOTATE_TEXT.to_string(),
        }
    }
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![(DEFAULT_ANNOTATE, DEFAULT_ANNOTATE_TEXT)]
}

pub const DEFAULT_ANNOTATE_TEXT: &str = r#"You are a linguistic annotation engine.
Analyze the TEXT below and fill in the DATA structure.
Return STRICT JSON only (one JSON object). No markdown. No extra text.

The output object must contain exactly these top-level keys:
- "wordData": object keyed by the same word-position strings as in DATA.
- "segmentData": object keyed by segment id.
- "idioms": array.

For every entry in wordData:
- Keep the "word" field.
- "pos": universal part-of-speech tag (NOUN, VERB, ADJ, ...).
- "lemma": dictionary form of the word.
- "best_translation": single best English translation in this context.
- "possible_translations": array of plausible English translations.
- "lemma_translations": array of English translations of the lemma.
- "details": object with any notes (grammatical features, register).

For every entry in segmentData:
- Keep "id", "startWordKey", "endWordKey".
- "translations": object with key "en" holding a fluent English translation
  of the whole segment.

For idioms: one entry per multi-word expression found in the TEXT, each with
"id" (stable slug), "text", "startWordKey", "endWordKey" and a "translation"
field. Use word positions from DATA. Return [] when there are none.

TEXT:
{{batch_text}}

DATA:
{{batch_data}}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_placeholders() {
        let out = render_template("A {{x}} B {{y}} {{x}}", &[("x", "1"), ("y", "2")]);
        assert_eq!(out, "A 1 B 2 1");
    }

    #[test]
    fn default_template_has_both_slots() {
        assert!(DEFAULT_ANNOTATE_TEXT.contains("{{batch_text}}"));
        assert!(DEFAULT_ANNOTATE_TEXT.contains("{{batch_data}}"));
    }
}
