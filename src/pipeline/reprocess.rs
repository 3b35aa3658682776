use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::pipeline::annotator::AnnotationPipeline;
use crate::pipeline::integrator::{IntegrationCounts, SharedDocument};
use crate::pipeline::prompts::render_template;
use crate::service::AnnotationClient;
use crate::tokenizer::Token;

/// Word and token extent of the text actually sent to the service for a
/// reprocess request.
#[derive(Clone, Copy, Debug)]
pub(super) struct ContextWindow {
    pub(super) start_word: u32,
    pub(super) end_word: u32,
    pub(super) start_token: usize,
    pub(super) end_token: usize,
}

/// Widen `[start, end]` symmetrically when it is narrower than the context
/// threshold, clamped to document bounds, and map the resulting word range
/// onto token indices.
pub(super) fn context_window(
    tokens: &[Token],
    total_words: u32,
    start: u32,
    end: u32,
    min_range_for_context: u32,
    context_word_window: u32,
) -> Option<ContextWindow> {
    let range_len = end - start + 1;
    let (start_word, end_word) = if range_len < min_range_for_context {
        (
            start.saturating_sub(context_word_window).max(1),
            (end + context_word_window).min(total_words),
        )
    } else {
        (start, end)
    };

    let mut start_token: Option<usize> = None;
    let mut end_token: Option<usize> = None;
    for (i, token) in tokens.iter().enumerate() {
        let Some(wp) = token.word_pos else { continue };
        if wp >= start_word && start_token.is_none() {
            start_token = Some(i);
        }
        if wp <= end_word {
            end_token = Some(i);
        } else {
            break;
        }
    }
    Some(ContextWindow {
        start_word,
        end_word,
        start_token: start_token?,
        end_token: end_token?,
    })
}

impl<C: AnnotationClient> AnnotationPipeline<C> {
    /// Re-annotate the word range `[start, end]`, widening the context
    /// shipped to the service when the range is small. Only the original
    /// range is overwritten; failures land in the failure log like any
    /// batch. Returns the integration counts on success.
    pub async fn reprocess_range(
        &self,
        doc: &SharedDocument,
        tokens: &[Token],
        total_words: u32,
        start: u32,
        end: u32,
    ) -> anyhow::Result<Option<IntegrationCounts>> {
        let label = format!("range_{start}-{end}");
        let Some(window) = context_window(
            tokens,
            total_words,
            start,
            end,
            self.cfg.min_range_for_context,
            self.cfg.context_word_window,
        ) else {
            anyhow::bail!("no tokens found for word range {start}-{end}");
        };
        if window.start_word < start || window.end_word > end {
            self.progress.info(format!(
                "range {start}-{end}: widening context to words {}-{}",
                window.start_word, window.end_word
            ));
        }

        let context_text: String = tokens[window.start_token..=window.end_token]
            .iter()
            .map(|t| t.text.as_str())
            .collect();
        let payload = doc.reprocess_payload(window.start_word, window.end_word, start, end);
        let payload_json = serde_json::to_string_pretty(&payload)?;
        let prompt = render_template(
            &self.cfg.prompt,
            &[
                ("batch_text", context_text.trim()),
                ("batch_data", payload_json.as_str()),
            ],
        );
        let _ = self.trace.write_batch_text(&label, "prompt", &prompt);

        // A single request still goes through the shared limiter so a
        // reprocess can run alongside other traffic without exceeding it.
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency));
        match self
            .annotate_with_retries(&semaphore, &prompt, &label)
            .await
        {
            Ok((response, _raw)) => {
                let counts = doc.apply_reprocess(start, end, &response);
                self.progress.info(format!(
                    "range {start}-{end}: {} words, {} segments, {} idioms replaced",
                    counts.words_updated,
                    counts.segments_updated + counts.segments_added,
                    counts.idioms_added,
                ));
                Ok(Some(counts))
            }
            Err(mut detail) => {
                detail.input_payload = Some(payload_json);
                self.progress
                    .warn(format!("range {start}-{end} failed: {}", detail.status));
                self.failures.append(&label, &detail)?;
                Ok(None)
            }
        }
    }
}

/// Token-level check used by the CLI before accepting a range.
pub fn range_is_valid(total_words: u32, start: u32, end: u32) -> bool {
    start >= 1 && start <= end && end <= total_words
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::document::Document;
    use crate::pipeline::config::{PipelineConfig, RetryPolicy};
    use crate::progress::ConsoleProgress;
    use crate::service::ServiceError;
    use crate::splitter::SplitConfig;
    use crate::tokenizer::{tokenize, tokenize_into};

    #[test]
    fn narrow_range_gets_widened_and_clamped() {
        let (tokens, total) = tokenize("a b c d e f g h i j");
        let window = context_window(&tokens, total, 4, 6, 7, 5).unwrap();
        assert_eq!((window.start_word, window.end_word), (1, 10));

        // Wide enough ranges go out untouched.
        let window = context_window(&tokens, total, 2, 9, 7, 5).unwrap();
        assert_eq!((window.start_word, window.end_word), (2, 9));
    }

    #[test]
    fn window_maps_onto_token_indices() {
        let (tokens, total) = tokenize("one two three four five six seven eight nine ten");
        let window = context_window(&tokens, total, 3, 5, 3, 5).unwrap();
        assert_eq!((window.start_word, window.end_word), (3, 5));
        let text: String = tokens[window.start_token..=window.end_token]
            .iter()
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(text, "three four five");
    }

    struct FnClient<F>(F);

    impl<F: Fn(&str) -> Result<String, ServiceError>> crate::service::AnnotationClient for FnClient<F> {
        async fn annotate(&self, prompt: &str) -> Result<String, ServiceError> {
            (self.0)(prompt)
        }
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            split: SplitConfig::default(),
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
            context_word_window: 2,
            autosave_every: 100,
            trace_dir: dir.join("_trace"),
            trace_prompts: false,
            failure_log: dir.join("failed_batches.jsonl"),
            prompt: "TEXT:\n{{batch_text}}\nDATA:\n{{batch_data}}".to_string(),
        }
    }

    #[tokio::test]
    async fn reprocess_widens_prompt_but_scopes_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let text = "a b c d e f g h i j";
        let mut doc = Document::from_text(text);
        let (tokens, total) = tokenize_into(text, &mut doc.word_database);
        let doc = crate::pipeline::SharedDocument::new(doc);

        let client = FnClient(|prompt: &str| -> Result<String, ServiceError> {
            // Context words b..h must be in the prompt text.
            assert!(prompt.contains("b c d e f g h"));
            Ok(serde_json::json!({
                "wordData": {
                    "2": {"word": "b", "pos": "X", "lemma": "b", "best_translation": "ctx"},
                    "5": {"word": "e", "pos": "X", "lemma": "e", "best_translation": "mid"},
                },
                "segmentData": {
                    "seg-4-6": {"id": "seg-4-6", "startWordKey": 4, "endWordKey": 6,
                                 "translations": {"en": "middle"}},
                },
                "idioms": [],
            })
            .to_string())
        });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let counts = pipeline
            .reprocess_range(&doc, &tokens, total, 4, 6)
            .await
            .unwrap()
            .expect("reprocess succeeded");
        assert_eq!(counts.words_updated, 1);
        doc.with(|d| {
            assert!(d.word_database[&2].best_translation.is_none());
            assert_eq!(d.word_database[&5].best_translation.as_deref(), Some("mid"));
            assert_eq!(d.segments[0].id, "seg-4-6");
        });
    }

    #[tokio::test]
    async fn failed_reprocess_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let failure_log = cfg.failure_log.clone();
        let text = "a b c d e f g h i j";
        let mut doc = Document::from_text(text);
        let (tokens, total) = tokenize_into(text, &mut doc.word_database);
        let doc = crate::pipeline::SharedDocument::new(doc);

        let client =
            FnClient(|_: &str| -> Result<String, ServiceError> { Ok("garbage".to_string()) });
        let pipeline = AnnotationPipeline::new(cfg, client, ConsoleProgress::new(false)).unwrap();
        let counts = pipeline
            .reprocess_range(&doc, &tokens, total, 4, 6)
            .await
            .unwrap();
        assert!(counts.is_none());

        let log = std::fs::read_to_string(&failure_log).unwrap();
        let record: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(record["batchIndex"], "range_4-6");
        assert_eq!(record["status"], "validation_failed");
    }

    #[test]
    fn range_validation() {
        assert!(range_is_valid(10, 1, 10));
        assert!(range_is_valid(10, 4, 4));
        assert!(!range_is_valid(10, 0, 3));
        assert!(!range_is_valid(10, 5, 4));
        assert!(!range_is_valid(10, 5, 11));
    }
}
