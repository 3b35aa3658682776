use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::config::{
    find_default_config, load_config, AppConfig, DEFAULT_CONFIG_FILENAME,
};
use crate::pipeline::prompts::{default_prompt_files, PromptSet, DEFAULT_PROMPTS_DIR};
use crate::splitter::SplitConfig;

/// One bounded retry schedule. `delay_for(0)` is the wait after the first
/// failed attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn transport() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            exponential: true,
        }
    }

    pub fn validation() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(5),
            exponential: false,
        }
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.base_delay * 2u32.saturating_pow(attempt)
        } else {
            self.base_delay
        }
    }
}

/// Everything the annotation pipeline needs for one run, resolved from the
/// config file plus CLI overrides. No ambient globals; this travels with
/// the pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub split: SplitConfig,
    pub concurrency: usize,
    pub transport_retry: RetryPolicy,
    pub validation_retry: RetryPolicy,
    pub min_range_for_context: u32,
    pub context_word_window: u32,
    pub autosave_every: usize,
    pub trace_dir: PathBuf,
    pub trace_prompts: bool,
    pub failure_log: PathBuf,
    pub prompt: String,
}

impl PipelineConfig {
    pub fn from_config_and_args(
        workdir: &Path,
        config_path: Option<PathBuf>,
        batch_size: Option<u32>,
        concurrency: Option<usize>,
    ) -> anyhow::Result<(Self, AppConfig, PathBuf)> {
        let cfg_file = config_path
            .or_else(|| std::env::var("GLOSSWORKS_CONFIG").ok().map(PathBuf::from))
            .or_else(|| find_default_config(workdir, DEFAULT_CONFIG_FILENAME));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            if p.exists() {
                file_cfg = load_config(p)?;
            }
        }
        let cfg_path = cfg_file.unwrap_or_else(|| workdir.join(DEFAULT_CONFIG_FILENAME));

        let p = &file_cfg.pipeline;
        let split = SplitConfig {
            target_words_per_batch: batch_size
                .or(p.target_words_per_batch)
                .unwrap_or(SplitConfig::default().target_words_per_batch)
                .max(1),
            backward_range: p
                .backward_range
                .unwrap_or(SplitConfig::default().backward_range),
            forward_range: p
                .forward_range
                .unwrap_or(SplitConfig::default().forward_range),
        };

        let transport_retry = RetryPolicy {
            max_attempts: p.max_api_retries.unwrap_or(3).max(1),
            base_delay: Duration::from_secs(p.api_retry_delay_secs.unwrap_or(10)),
            exponential: true,
        };
        let validation_retry = RetryPolicy {
            max_attempts: p.max_validation_retries.unwrap_or(6).max(1),
            base_delay: Duration::from_secs(p.validation_retry_delay_secs.unwrap_or(5)),
            exponential: false,
        };

        let trace_dir = p.trace_dir.clone().unwrap_or_else(|| "_trace".to_string());
        let trace_dir = if Path::new(&trace_dir).is_absolute() {
            PathBuf::from(trace_dir)
        } else {
            workdir.join(trace_dir)
        };
        let failure_log = p
            .failure_log
            .clone()
            .unwrap_or_else(|| "failed_batches.jsonl".to_string());
        let failure_log = if Path::new(&failure_log).is_absolute() {
            PathBuf::from(failure_log)
        } else {
            workdir.join(failure_log)
        };

        let prompts = if cfg_path.exists() {
            PromptSet::load(&cfg_path, &file_cfg).context("load prompts")?
        } else {
            PromptSet::builtin()
        };

        let pipeline = Self {
            split,
            concurrency: concurrency.or(p.concurrency).unwrap_or(5).max(1),
            transport_retry,
            validation_retry,
            min_range_for_context: p.min_range_for_context.unwrap_or(7),
            context_word_window: p.context_word_window.unwrap_or(5),
            autosave_every: p.autosave_every.unwrap_or(10).max(1),
            trace_dir,
            trace_prompts: p.trace_prompts.unwrap_or(false),
            failure_log,
            prompt: prompts.annotate,
        };
        Ok((pipeline, file_cfg, cfg_path))
    }
}

/// Write the default config and prompt files so a run can start from a
/// clean directory.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;
    for (fname, body) in default_prompt_files() {
        let p = prompts_dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write prompt: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }

    let cfg_text = r#"[pipeline]
target_words_per_batch = 30
backward_range = 5
forward_range = 15

# Concurrent in-flight service calls across the whole run.
concurrency = 5

# Save the document after every N integrated batches.
autosave_every = 10

trace_dir = "_trace"
trace_prompts = false
failure_log = "failed_batches.jsonl"

# Reprocess ranges narrower than min_range_for_context are widened by
# context_word_window words on each side before being sent to the service.
min_range_for_context = 7
context_word_window = 5

max_api_retries = 3
max_validation_retries = 6
api_retry_delay_secs = 10
validation_retry_delay_secs = 5

[service]
model = "gemini-2.0-flash"
base_url = "https://generativelanguage.googleapis.com/v1beta"
api_key_env = "GLOSSWORKS_API_KEY"
timeout_secs = 120

[prompts]
annotate = "prompts/annotate.txt"
"#;

    std::fs::write(&cfg_path, cfg_text)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays() {
        let t = RetryPolicy::transport();
        assert_eq!(t.delay_for(0), Duration::from_secs(10));
        assert_eq!(t.delay_for(1), Duration::from_secs(20));
        assert_eq!(t.delay_for(2), Duration::from_secs(40));
        let v = RetryPolicy::validation();
        assert_eq!(v.delay_for(0), Duration::from_secs(5));
        assert_eq!(v.delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn init_writes_config_and_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = init_default_config(dir.path(), false).unwrap();
        assert!(cfg_path.is_file());
        assert!(dir.path().join("prompts/annotate.txt").is_file());

        let (pipeline, _, _) = PipelineConfig::from_config_and_args(
            dir.path(),
            Some(cfg_path),
            Some(12),
            None,
        )
        .unwrap();
        assert_eq!(pipeline.split.target_words_per_batch, 12);
        assert_eq!(pipeline.concurrency, 5);
        assert!(pipeline.prompt.contains("{{batch_text}}"));
    }
}
