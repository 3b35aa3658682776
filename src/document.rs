use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::splitter::BatchBounds;

/// Per-word annotation record. Annotation fields are `None` while pending;
/// a resolved field is always `Some`, so no real value can collide with the
/// pending state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WordEntry {
    /// Original surface text at this position. Never replaced by
    /// service-echoed variants.
    #[serde(rename = "word")]
    pub surface: String,
    #[serde(default)]
    pub pos: Option<String>,
    #[serde(default)]
    pub lemma: Option<String>,
    #[serde(default)]
    pub best_translation: Option<String>,
    #[serde(default)]
    pub possible_translations: BTreeSet<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, Value>,
    #[serde(default)]
    pub freq: Option<u32>,
    #[serde(default)]
    pub freq_till_now: Option<u32>,
    #[serde(default)]
    pub first_inst: Option<bool>,
    #[serde(default)]
    pub lemma_translations: BTreeSet<String>,
    #[serde(default)]
    pub most_frequent_lemma: Option<String>,
}

impl WordEntry {
    pub fn pending(surface: &str) -> Self {
        Self {
            surface: surface.to_string(),
            ..Self::default()
        }
    }

    /// The canonical "processed" check: part of speech, lemma and best
    /// translation all resolved.
    #[must_use]
    pub fn is_annotated(&self) -> bool {
        self.pos.is_some() && self.lemma.is_some() && self.best_translation.is_some()
    }

    /// Reset annotation fields to pending. Surface and the stamped frequency
    /// fields survive; stats are recalculated before the next save anyway.
    pub fn clear_annotations(&mut self) {
        self.pos = None;
        self.lemma = None;
        self.best_translation = None;
        self.possible_translations.clear();
        self.details.clear();
        self.lemma_translations.clear();
        self.most_frequent_lemma = None;
    }
}

/// A bounded word range carrying whole-span translations, unique by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    #[serde(rename = "startWordKey")]
    pub start_word_key: u32,
    #[serde(rename = "endWordKey")]
    pub end_word_key: u32,
    #[serde(default)]
    pub translations: serde_json::Map<String, Value>,
}

/// A multi-word expression spanning a word range, unique by id. Extra
/// service-supplied fields ride along untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Idiom {
    pub id: String,
    pub text: String,
    #[serde(rename = "startWordKey")]
    pub start_word_key: u32,
    #[serde(rename = "endWordKey")]
    pub end_word_key: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Idiom {
    #[must_use]
    pub fn contained_in(&self, start: u32, end: u32) -> bool {
        self.start_word_key >= start && self.end_word_key <= end
    }
}

pub fn segment_id_for(start: u32, end: u32) -> String {
    format!("seg-{start}-{end}")
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClearOutcome {
    pub words_cleared: usize,
    pub segments_cleared: usize,
    pub idioms_removed: usize,
}

/// The persisted unit: source text plus everything derived from it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    pub input_text: String,
    pub word_database: BTreeMap<u32, WordEntry>,
    pub segments: Vec<Segment>,
    pub idioms: Vec<Idiom>,
    /// Opaque word signatures owned by an external collaborator; carried
    /// through load/save untouched.
    pub known_words: Vec<Value>,
}

/// On-disk shape: word positions become decimal string keys. Kept separate
/// from `Document` so the file format can evolve independently.
#[derive(Serialize, Deserialize)]
struct DocumentFile {
    #[serde(rename = "inputText")]
    input_text: String,
    #[serde(rename = "wordDatabase")]
    word_database: BTreeMap<String, WordEntry>,
    segments: Vec<Segment>,
    idioms: Vec<Idiom>,
    #[serde(rename = "knownWords")]
    known_words: Vec<Value>,
}

impl Document {
    pub fn from_text(text: &str) -> Self {
        Self {
            input_text: text.to_string(),
            ..Self::default()
        }
    }

    /// Load a previously saved document. Any missing required top-level key
    /// is a hard error; non-numeric word keys are dropped.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read document: {}", path.display()))?;
        let file: DocumentFile = serde_json::from_str(&text)
            .with_context(|| format!("parse document (inputText/wordDatabase/segments/idioms/knownWords required): {}", path.display()))?;
        let mut word_database = BTreeMap::new();
        for (key, entry) in file.word_database {
            if let Ok(pos) = key.parse::<u32>() {
                word_database.insert(pos, entry);
            }
        }
        Ok(Self {
            input_text: file.input_text,
            word_database,
            segments: file.segments,
            idioms: file.idioms,
            known_words: file.known_words,
        })
    }

    /// Save atomically: serialize to a temp file in the target directory,
    /// then rename over the destination.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = DocumentFile {
            input_text: self.input_text.clone(),
            word_database: self
                .word_database
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            segments: self.segments.clone(),
            idioms: self.idioms.clone(),
            known_words: self.known_words.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize document")?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes()).context("write document")?;
        tmp.persist(path)
            .with_context(|| format!("replace document: {}", path.display()))?;
        Ok(())
    }

    pub fn find_segment(&self, id: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.id == id)
    }

    pub fn find_idiom(&self, id: &str) -> Option<usize> {
        self.idioms.iter().position(|i| i.id == id)
    }

    /// Reset the given word entries to pending and drop idioms fully
    /// contained in the covered range. Segment translations stay; use
    /// [`Document::clear_batch`] for that.
    pub fn clear_words<I: IntoIterator<Item = u32>>(&mut self, keys: I) -> ClearOutcome {
        let mut outcome = ClearOutcome::default();
        let mut min_key: Option<u32> = None;
        let mut max_key: Option<u32> = None;
        for key in keys {
            if let Some(entry) = self.word_database.get_mut(&key) {
                entry.clear_annotations();
                outcome.words_cleared += 1;
            }
            min_key = Some(min_key.map_or(key, |m| m.min(key)));
            max_key = Some(max_key.map_or(key, |m| m.max(key)));
        }
        if let (Some(min), Some(max)) = (min_key, max_key) {
            let before = self.idioms.len();
            self.idioms.retain(|i| !i.contained_in(min, max));
            outcome.idioms_removed = before - self.idioms.len();
        }
        outcome
    }

    /// The inverse of annotating one batch: pending words, emptied segment
    /// translations, no custom segments or idioms left inside the span.
    pub fn clear_batch(&mut self, bounds: &BatchBounds) -> ClearOutcome {
        let mut outcome = self.clear_words(bounds.word_keys.iter().copied());
        if let Some(idx) = self.find_segment(&bounds.segment_id) {
            self.segments[idx].translations = serde_json::Map::new();
            outcome.segments_cleared += 1;
        }
        if !bounds.is_empty() {
            // Custom segments spanning exactly this batch shadow the batch
            // segment; drop them too.
            let before = self.segments.len();
            self.segments.retain(|s| {
                !(s.start_word_key == bounds.start_word_key
                    && s.end_word_key == bounds.end_word_key
                    && s.id != bounds.segment_id)
            });
            outcome.segments_cleared += before - self.segments.len();
        }
        outcome
    }

    pub fn clear_range(&mut self, start: u32, end: u32) -> ClearOutcome {
        self.clear_words(start..=end)
    }
}
