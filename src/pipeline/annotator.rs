use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::pipeline::config::PipelineConfig;
use crate::pipeline::integrator::{IntegrationCounts, SharedDocument};
use crate::pipeline::prompts::render_template;
use crate::pipeline::trace::TraceWriter;
use crate::progress::ConsoleProgress;
use crate::service::{validate_response, AnnotationClient, AnnotationResponse, ServiceError};
use crate::splitter::{batch_text, BatchBounds};
use crate::tokenizer::Token;

/// Which batch indices a run is allowed to touch.
#[derive(Clone, Debug, Default)]
pub enum BatchSelection {
    #[default]
    All,
    /// Unprocessed batches up to and including this index.
    UpTo(usize),
    Explicit(BTreeSet<usize>),
}

impl BatchSelection {
    #[must_use]
    pub fn includes(&self, index: usize) -> bool {
        match self {
            Self::All => true,
            Self::UpTo(limit) => index <= *limit,
            Self::Explicit(set) => set.contains(&index),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Why a batch was given up on, plus the evidence for offline inspection.
pub(super) struct FailureDetail {
    pub(super) status: String,
    pub(super) input_payload: Option<String>,
    pub(super) last_raw_response: Option<String>,
}

#[derive(Serialize)]
struct FailureRecord {
    #[serde(rename = "batchIndex")]
    batch_index: String,
    status: String,
    #[serde(rename = "inputPayload")]
    input_payload: Option<String>,
    #[serde(rename = "lastRawResponse")]
    last_raw_response: Option<String>,
    timestamp: String,
}

/// Append-only JSON Lines sink for exhausted-retry batches.
pub(super) struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(super) fn append(&self, batch_label: &str, detail: &FailureDetail) -> anyhow::Result<()> {
        let record = FailureRecord {
            batch_index: batch_label.to_string(),
            status: detail.status.clone(),
            input_payload: detail.input_payload.clone(),
            last_raw_response: detail.last_raw_response.clone(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&record).context("serialize failure record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open failure log: {}", self.path.display()))?;
        writeln!(file, "{line}").context("append failure record")?;
        Ok(())
    }
}

/// Fans unprocessed batches out to the annotation service under a global
/// concurrency cap, validates and integrates each response, and records
/// exhausted batches without ever aborting the run.
pub struct AnnotationPipeline<C> {
    pub(super) cfg: PipelineConfig,
    pub(super) client: C,
    pub(super) progress: ConsoleProgress,
    pub(super) trace: TraceWriter,
    pub(super) failures: FailureLog,
}

impl<C: AnnotationClient> AnnotationPipeline<C> {
    pub fn new(cfg: PipelineConfig, client: C, progress: ConsoleProgress) -> anyhow::Result<Self> {
        let trace = TraceWriter::new(cfg.trace_dir.clone(), cfg.trace_prompts)?;
        let failures = FailureLog::new(cfg.failure_log.clone());
        Ok(Self {
            cfg,
            client,
            progress,
            trace,
            failures,
        })
    }

    /// Annotate every selected, not-yet-processed batch. Always returns a
    /// report; individual batch failures land in the failure log.
    pub async fn run(
        &self,
        doc: &SharedDocument,
        tokens: &[Token],
        batches: &[BatchBounds],
        selection: &BatchSelection,
        autosave_path: Option<&Path>,
    ) -> anyhow::Result<RunReport> {
        let mut report = RunReport::default();
        let mut pending: Vec<&BatchBounds> = Vec::new();
        for bounds in batches {
            if !selection.includes(bounds.index) {
                continue;
            }
            if doc.is_batch_annotated(&bounds.word_keys) {
                report.skipped += 1;
                continue;
            }
            pending.push(bounds);
        }
        self.progress.info(format!(
            "{} batches to annotate ({} already processed)",
            pending.len(),
            report.skipped
        ));
        if pending.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency));
        let total = pending.len();
        let done = AtomicUsize::new(0);
        let integrated = AtomicUsize::new(0);

        let outcomes = stream::iter(pending.into_iter().map(|bounds| {
            let semaphore = Arc::clone(&semaphore);
            let done = &done;
            let integrated = &integrated;
            async move {
                let result = self.process_batch(doc, tokens, bounds, &semaphore).await;
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.progress.progress("batches", finished, total);
                if result.is_ok() {
                    let n = integrated.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(path) = autosave_path {
                        if n % self.cfg.autosave_every == 0 {
                            self.autosave(doc, path);
                        }
                    }
                }
                (bounds.index, result)
            }
        }))
        .buffer_unordered(self.cfg.concurrency)
        .collect::<Vec<_>>()
        .await;

        for (index, outcome) in outcomes {
            match outcome {
                Ok(counts) => {
                    report.succeeded += 1;
                    self.progress.info(format!(
                        "batch {index}: {} words, {} segments, {} idioms",
                        counts.words_updated,
                        counts.segments_updated + counts.segments_added,
                        counts.idioms_updated + counts.idioms_added,
                    ));
                }
                Err(detail) => {
                    report.failed += 1;
                    self.progress
                        .warn(format!("batch {index} failed: {}", detail.status));
                    if let Err(err) = self.failures.append(&index.to_string(), &detail) {
                        self.progress.warn(format!("failure log write failed: {err:#}"));
                    }
                }
            }
        }
        Ok(report)
    }

    fn autosave(&self, doc: &SharedDocument, path: &Path) {
        doc.recalculate_stats();
        if let Err(err) = doc.snapshot().save(path) {
            self.progress.warn(format!("autosave failed: {err:#}"));
        }
    }

    async fn process_batch(
        &self,
        doc: &SharedDocument,
        tokens: &[Token],
        bounds: &BatchBounds,
        semaphore: &Semaphore,
    ) -> Result<IntegrationCounts, FailureDetail> {
        let label = format!("batch_{:06}", bounds.index);
        let text = batch_text(tokens, bounds);
        let payload = doc.batch_payload(bounds);
        let payload_json = match serde_json::to_string_pretty(&payload) {
            Ok(json) => json,
            Err(err) => {
                return Err(FailureDetail {
                    status: format!("payload_serialize_error: {err}"),
                    input_payload: None,
                    last_raw_response: None,
                })
            }
        };
        let prompt = render_template(
            &self.cfg.prompt,
            &[
                ("batch_text", text.trim()),
                ("batch_data", payload_json.as_str()),
            ],
        );
        let _ = self.trace.write_batch_text(&label, "prompt", &prompt);

        match self.annotate_with_retries(semaphore, &prompt, &label).await {
            Ok((response, _raw)) => Ok(doc.apply_batch(&response)),
            Err(mut detail) => {
                detail.input_payload = Some(payload_json);
                Err(detail)
            }
        }
    }

    /// The two nested retry loops. The concurrency permit covers one full
    /// transport cycle (call + backoff) and is released between validation
    /// attempts.
    pub(super) async fn annotate_with_retries(
        &self,
        semaphore: &Semaphore,
        prompt: &str,
        label: &str,
    ) -> Result<(AnnotationResponse, String), FailureDetail> {
        let max = self.cfg.validation_retry.max_attempts;
        let mut last_raw: Option<String> = None;
        for attempt in 0..max {
            let raw = {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                match self.call_service(prompt, label).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        return Err(FailureDetail {
                            status: format!("transport_error: {err}"),
                            input_payload: None,
                            last_raw_response: last_raw,
                        })
                    }
                }
            };
            let _ = self.trace.write_batch_text(label, "response", &raw);
            match validate_response(&raw) {
                Ok(response) => return Ok((response, raw)),
                Err(err) => {
                    self.progress.warn(format!(
                        "{label}: validation failed (attempt {}/{max}): {err}",
                        attempt + 1
                    ));
                    last_raw = Some(raw);
                    if attempt + 1 < max {
                        tokio::time::sleep(self.cfg.validation_retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(FailureDetail {
            status: "validation_failed".to_string(),
            input_payload: None,
            last_raw_response: last_raw,
        })
    }

    /// Transport retry loop: transient errors back off exponentially;
    /// anything else surfaces immediately.
    async fn call_service(&self, prompt: &str, label: &str) -> Result<String, ServiceError> {
        let mut attempt: u32 = 0;
        loop {
            match self.client.annotate(prompt).await {
                Ok(raw) => return Ok(raw),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.cfg.transport_retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.cfg.transport_retry.delay_for(attempt - 1);
                    self.progress.warn(format!(
                        "{label}: transient service error ({err}); retrying in {}s",
                        delay.as_secs()
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::document::Document;
    use crate::pipeline::config::RetryPolicy;
    use crate::service::EMPTY_RESPONSE_JSON;
    use crate::splitter::{batch_bounds, find_split_points, SplitConfig};
    use crate::tokenizer::tokenize_into;

    struct FnClient<F>(F);

    impl<F: Fn(&str) -> Result<String, ServiceError>> AnnotationClient for FnClient<F> {
        async fn annotate(&self, prompt: &str) -> Result<String, ServiceError> {
            (self.0)(prompt)
        }
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            split: SplitConfig {
                target_words_per_batch: 2,
                backward_range: 5,
                forward_range: 15,
            },
            concurrency: 2,
            transport_retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::ZERO,
                exponential: false,
            },
            validation_retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::ZERO,
                exponential: false,
            },
            min_range_for_context: 7,
            context_word_window: 5,
            autosave_every: 100,
            trace_dir: dir.join("_trace"),
            trace_prompts: false,
            failure_log: dir.join("failed_batches.jsonl"),
            prompt: "TEXT:\n{{batch_text}}\nDATA:\n{{batch_data}}".to_string(),
        }
    }

    fn fixture(text: &str, cfg: &PipelineConfig) -> (SharedDocument, Vec<Token>, Vec<BatchBounds>) {
        let mut doc = Document::from_text(text);
        let (tokens, total_words) = tokenize_into(text, &mut doc.word_database);
        let points = find_split_points(&tokens, total_words, cfg.split);
        let batches = batch_bounds(&tokens, &points);
        (SharedDocument::new(doc), tokens, batches)
    }

    fn annotation_json(entries: &[(u32, &str)]) -> String {
        let mut word_data = serde_json::Map::new();
        for (pos, word) in entries {
            word_data.insert(
                pos.to_string(),
                serde_json::json!({
                    "word": word,
                    "pos": "NOUN",
                    "lemma": word.to_lowercase(),
                    "best_translation": format!("t-{word}"),
                }),
            );
        }
        serde_json::json!({
            "wordData": word_data,
            "segmentData": {},
            "idioms": [],
        })
        .to_string()
    }

    #[tokio::test]
    async fn annotated_batches_are_skipped_without_calls() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let (doc, tokens, batches) = fixture("alpha beta. gamma delta.", &cfg);
        doc.with_mut(|d| {
            for entry in d.word_database.values_mut() {
                entry.pos = Some("NOUN".into());
                entry.lemma = Some("x".into());
                entry.best_translation = Some("y".into());
            }
        });

        let calls = AtomicUsize::new(0);
        let client = FnClient(|_: &str| -> Result<String, ServiceError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(EMPTY_RESPONSE_JSON.to_string())
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::All, None)
            .await
            .unwrap();
        assert_eq!(report.skipped, batches.len());
        assert_eq!(report.succeeded + report.failed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_failing_batch_does_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let failure_log = cfg.failure_log.clone();
        let (doc, tokens, batches) = fixture("alpha beta. gamma delta.", &cfg);
        assert_eq!(batches.len(), 2);

        // Batch 1 keeps returning prose; batch 2 annotates cleanly.
        let client = FnClient(|prompt: &str| -> Result<String, ServiceError> {
            if prompt.contains("alpha") {
                Ok("sorry, I cannot".to_string())
            } else {
                Ok(annotation_json(&[(3, "gamma"), (4, "delta")]))
            }
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::All, None)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        doc.with(|d| {
            assert!(!d.word_database[&1].is_annotated());
            assert!(d.word_database[&3].is_annotated());
            assert_eq!(
                d.word_database[&3].best_translation.as_deref(),
                Some("t-gamma")
            );
        });

        let log = std::fs::read_to_string(&failure_log).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["batchIndex"], "1");
        assert_eq!(record["status"], "validation_failed");
        assert_eq!(record["lastRawResponse"], "sorry, I cannot");
        assert!(record["inputPayload"].as_str().unwrap().contains("alpha"));
    }

    #[tokio::test]
    async fn second_run_skips_integrated_batches() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let (doc, tokens, batches) = fixture("alpha beta. gamma delta.", &cfg);

        let calls = AtomicUsize::new(0);
        let client = FnClient(|prompt: &str| -> Result<String, ServiceError> {
            calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains("alpha") {
                Ok(annotation_json(&[(1, "alpha"), (2, "beta")]))
            } else {
                Ok(annotation_json(&[(3, "gamma"), (4, "delta")]))
            }
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::All, None)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::All, None)
            .await
            .unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_transport_errors_are_retried_then_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let (doc, tokens, batches) = fixture("alpha beta.", &cfg);
        assert_eq!(batches.len(), 1);

        let calls = AtomicUsize::new(0);
        let client = FnClient(|_: &str| -> Result<String, ServiceError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Status {
                status: 429,
                retryable: true,
                message: "rate limited".to_string(),
            })
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::All, None)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        // Transport budget only; the validation loop must not re-enter.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_transport_error_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let (doc, tokens, batches) = fixture("alpha beta.", &cfg);

        let calls = AtomicUsize::new(0);
        let client = FnClient(|_: &str| -> Result<String, ServiceError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Status {
                status: 400,
                retryable: false,
                message: "bad request".to_string(),
            })
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::All, None)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn selection_limits_which_batches_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let (doc, tokens, batches) = fixture("alpha beta. gamma delta. epsilon zeta.", &cfg);
        assert!(batches.len() >= 3);

        let calls = AtomicUsize::new(0);
        let client = FnClient(|_: &str| -> Result<String, ServiceError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(EMPTY_RESPONSE_JSON.to_string())
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let report = pipeline
            .run(&doc, &tokens, &batches, &BatchSelection::UpTo(1), None)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let report = pipeline
            .run(
                &doc,
                &tokens,
                &batches,
                &BatchSelection::Explicit([2].into_iter().collect()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
