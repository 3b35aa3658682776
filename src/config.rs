use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "glossworks.toml";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_API_KEY_ENV: &str = "GLOSSWORKS_API_KEY";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    #[serde(default)]
    pub target_words_per_batch: Option<u32>,
    #[serde(default)]
    pub backward_range: Option<u32>,
    #[serde(default)]
    pub forward_range: Option<u32>,

    /// Cap on concurrent in-flight service calls for a whole run.
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub autosave_every: Option<usize>,

    #[serde(default)]
    pub trace_dir: Option<String>,
    #[serde(default)]
    pub trace_prompts: Option<bool>,
    #[serde(default)]
    pub failure_log: Option<String>,

    /// Reprocess ranges narrower than this get surrounding context words.
    #[serde(default)]
    pub min_range_for_context: Option<u32>,
    #[serde(default)]
    pub context_word_window: Option<u32>,

    #[serde(default)]
    pub max_api_retries: Option<u32>,
    #[serde(default)]
    pub max_validation_retries: Option<u32>,
    #[serde(default)]
    pub api_retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub validation_retry_delay_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ServiceSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in the config file.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub annotate: Option<String>,
}

/// Service endpoint with the credential resolved. Building one fails fast
/// when the key is missing, before any batch work starts.
#[derive(Clone, Debug)]
pub struct ResolvedService {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

pub fn resolve_service(
    cfg: &AppConfig,
    model_override: Option<String>,
) -> anyhow::Result<ResolvedService> {
    let model = model_override
        .or_else(|| cfg.service.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let base_url = cfg
        .service
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let key_env = cfg
        .service
        .api_key_env
        .clone()
        .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
    let api_key = std::env::var(&key_env)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            anyhow!("missing API key: set {key_env} (or change api_key_env in {DEFAULT_CONFIG_FILENAME})")
        })?;
    let timeout = Duration::from_secs(cfg.service.timeout_secs.unwrap_or(120));
    Ok(ResolvedService {
        model,
        base_url,
        api_key,
        timeout,
    })
}

pub fn find_file_upwards(start: &Path, filename: &str, max_depth: usize) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    for _ in 0..max_depth {
        let d = dir?;
        let cand = d.join(filename);
        if cand.is_file() {
            return Some(cand);
        }
        dir = d.parent().map(|p| p.to_path_buf());
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_with_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert!(cfg.pipeline.target_words_per_batch.is_none());
        assert!(cfg.service.model.is_none());
    }

    #[test]
    fn sections_parse() {
        let cfg: AppConfig = toml::from_str(
            r#"
[pipeline]
target_words_per_batch = 40
concurrency = 8

[service]
model = "gemini-2.5-flash"
api_key_env = "MY_KEY"
"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.target_words_per_batch, Some(40));
        assert_eq!(cfg.pipeline.concurrency, Some(8));
        assert_eq!(cfg.service.model.as_deref(), Some("gemini-2.5-flash"));
        assert_eq!(cfg.service.api_key_env.as_deref(), Some("MY_KEY"));
    }
}
