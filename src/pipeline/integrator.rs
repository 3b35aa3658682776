use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::document::{segment_id_for, Document, Idiom, Segment, WordEntry};
use crate::service::{AnnotationResponse, WireIdiom, WireSegment, WireWordEntry};
use crate::splitter::BatchBounds;
use crate::stats;

/// Structured context shipped with each request: the batch's current word
/// entries plus the segment/idiom records it owns. Shares the wire field
/// names the response contract uses.
#[derive(Clone, Debug, Serialize)]
pub struct BatchPayload {
    #[serde(rename = "wordData")]
    pub word_data: BTreeMap<String, WordEntry>,
    #[serde(rename = "segmentData")]
    pub segment_data: BTreeMap<String, Segment>,
    pub idioms: Vec<Idiom>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IntegrationCounts {
    pub words_updated: usize,
    pub segments_updated: usize,
    pub segments_added: usize,
    pub idioms_updated: usize,
    pub idioms_added: usize,
    pub idioms_removed: usize,
}

/// The single owner of the mutable document during a run. Every mutation
/// happens inside one of these transactional methods; the mutex never
/// outlives a method call, and no method suspends.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<Mutex<Document>>,
}

impl SharedDocument {
    pub fn new(doc: Document) -> Self {
        Self {
            inner: Arc::new(Mutex::new(doc)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        // A panicked holder can only have been another integration call;
        // the document is still structurally sound, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        f(&mut self.lock())
    }

    /// Clone of the current state, for saving without holding the lock
    /// across file IO.
    pub fn snapshot(&self) -> Document {
        self.lock().clone()
    }

    pub fn recalculate_stats(&self) {
        stats::recalculate(&mut self.lock().word_database);
    }

    /// The §skip rule: every owned position resolved. Empty batches are
    /// vacuously processed.
    pub fn is_batch_annotated(&self, word_keys: &BTreeSet<u32>) -> bool {
        let doc = self.lock();
        word_keys.iter().all(|key| {
            doc.word_database
                .get(key)
                .is_some_and(|entry| entry.is_annotated())
        })
    }

    pub fn batch_payload(&self, bounds: &BatchBounds) -> BatchPayload {
        let doc = self.lock();
        let mut word_data = BTreeMap::new();
        for key in &bounds.word_keys {
            if let Some(entry) = doc.word_database.get(key) {
                word_data.insert(key.to_string(), entry.clone());
            }
        }
        let segment = doc
            .find_segment(&bounds.segment_id)
            .map(|idx| doc.segments[idx].clone())
            .unwrap_or_else(|| Segment {
                id: bounds.segment_id.clone(),
                start_word_key: bounds.start_word_key,
                end_word_key: bounds.end_word_key,
                translations: serde_json::Map::new(),
            });
        let mut segment_data = BTreeMap::new();
        segment_data.insert(bounds.segment_id.clone(), segment);
        let idioms = doc
            .idioms
            .iter()
            .filter(|i| i.contained_in(bounds.start_word_key, bounds.end_word_key))
            .cloned()
            .collect();
        BatchPayload {
            word_data,
            segment_data,
            idioms,
        }
    }

    /// Payload for a reprocess request: word entries for the (possibly
    /// widened) context window plus one blank segment for the exact target
    /// range.
    pub fn reprocess_payload(
        &self,
        context_start: u32,
        context_end: u32,
        target_start: u32,
        target_end: u32,
    ) -> BatchPayload {
        let doc = self.lock();
        let mut word_data = BTreeMap::new();
        for (key, entry) in doc.word_database.range(context_start..=context_end) {
            word_data.insert(key.to_string(), entry.clone());
        }
        let id = segment_id_for(target_start, target_end);
        let segment = Segment {
            id: id.clone(),
            start_word_key: target_start,
            end_word_key: target_end,
            translations: serde_json::Map::new(),
        };
        let mut segment_data = BTreeMap::new();
        segment_data.insert(id, segment);
        BatchPayload {
            word_data,
            segment_data,
            idioms: Vec::new(),
        }
    }

    /// Apply one batch's validated response. Word updates are scoped to
    /// positions already in the database; segments and idioms upsert by id.
    pub fn apply_batch(&self, response: &AnnotationResponse) -> IntegrationCounts {
        let mut doc = self.lock();
        let mut counts = IntegrationCounts::default();
        apply_word_data(&mut doc, response, None, &mut counts);

        for (id, value) in &response.segment_data {
            let Ok(wire) = serde_json::from_value::<WireSegment>(value.clone()) else {
                continue;
            };
            match doc.find_segment(id) {
                Some(idx) => {
                    let seg = &mut doc.segments[idx];
                    seg.start_word_key = wire.start_word_key;
                    seg.end_word_key = wire.end_word_key;
                    seg.translations = wire.translations;
                    counts.segments_updated += 1;
                }
                None => {
                    doc.segments.push(Segment {
                        id: wire.id,
                        start_word_key: wire.start_word_key,
                        end_word_key: wire.end_word_key,
                        translations: wire.translations,
                    });
                    counts.segments_added += 1;
                }
            }
        }

        for value in &response.idioms {
            let Ok(wire) = serde_json::from_value::<WireIdiom>(value.clone()) else {
                continue;
            };
            upsert_idiom(&mut doc, wire, &mut counts);
        }
        counts
    }

    /// Apply a reprocess response: only words inside the original target
    /// range are eligible, the synthetic segment is pinned to the original
    /// range, and contained idioms are replaced wholesale.
    pub fn apply_reprocess(
        &self,
        start: u32,
        end: u32,
        response: &AnnotationResponse,
    ) -> IntegrationCounts {
        let mut doc = self.lock();
        let mut counts = IntegrationCounts::default();
        apply_word_data(&mut doc, response, Some((start, end)), &mut counts);

        let id = segment_id_for(start, end);
        if let Some(value) = response.segment_data.get(&id) {
            let translations = value
                .get("translations")
                .and_then(|t| t.as_object())
                .cloned();
            if let Some(translations) = translations {
                match doc.find_segment(&id) {
                    Some(idx) => {
                        let seg = &mut doc.segments[idx];
                        seg.start_word_key = start;
                        seg.end_word_key = end;
                        seg.translations = translations;
                        counts.segments_updated += 1;
                    }
                    None => {
                        doc.segments.push(Segment {
                            id: id.clone(),
                            start_word_key: start,
                            end_word_key: end,
                            translations,
                        });
                        counts.segments_added += 1;
                    }
                }
            }
        }

        let before = doc.idioms.len();
        doc.idioms.retain(|i| !i.contained_in(start, end));
        counts.idioms_removed = before - doc.idioms.len();
        for value in &response.idioms {
            let Ok(wire) = serde_json::from_value::<WireIdiom>(value.clone()) else {
                continue;
            };
            if wire.start_word_key >= start && wire.end_word_key <= end {
                upsert_idiom(&mut doc, wire, &mut counts);
            }
        }
        counts
    }
}

/// Field-wise overwrite of annotation fields, keeping the stored surface.
/// `scope` limits eligible positions (reprocess); unknown positions are
/// ignored either way.
fn apply_word_data(
    doc: &mut Document,
    response: &AnnotationResponse,
    scope: Option<(u32, u32)>,
    counts: &mut IntegrationCounts,
) {
    for (key, value) in &response.word_data {
        let Ok(pos) = key.parse::<u32>() else { continue };
        if let Some((start, end)) = scope {
            if pos < start || pos > end {
                continue;
            }
        }
        let Some(entry) = doc.word_database.get_mut(&pos) else {
            continue;
        };
        let Ok(wire) = serde_json::from_value::<WireWordEntry>(value.clone()) else {
            continue;
        };
        if let Some(v) = wire.pos {
            entry.pos = Some(v);
        }
        if let Some(v) = wire.lemma {
            entry.lemma = Some(v);
        }
        if let Some(v) = wire.best_translation {
            entry.best_translation = Some(v);
        }
        if let Some(v) = wire.possible_translations {
            entry.possible_translations = v.into_iter().collect();
        }
        if let Some(v) = wire.details {
            entry.details = v;
        }
        if let Some(v) = wire.lemma_translations {
            entry.lemma_translations = v.into_iter().collect();
        }
        counts.words_updated += 1;
    }
}

fn upsert_idiom(doc: &mut Document, wire: WireIdiom, counts: &mut IntegrationCounts) {
    let idiom = Idiom {
        id: wire.id,
        text: wire.text,
        start_word_key: wire.start_word_key,
        end_word_key: wire.end_word_key,
        extra: wire.extra,
    };
    match doc.find_idiom(&idiom.id) {
        Some(idx) => {
            doc.idioms[idx] = idiom;
            counts.idioms_updated += 1;
        }
        None => {
            doc.idioms.push(idiom);
            counts.idioms_added += 1;
        }
    }
}
