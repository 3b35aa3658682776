use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::document::WordEntry;

type GroupKey = (String, Option<String>, Option<String>);

fn refined_key(entry: &WordEntry) -> GroupKey {
    (
        entry.surface.to_lowercase(),
        entry.most_frequent_lemma.clone(),
        entry.pos.clone(),
    )
}

#[derive(Default)]
struct GroupAgg {
    total: u32,
    translations: BTreeSet<String>,
    lemma_translations: BTreeSet<String>,
}

/// Recompute frequency and first-occurrence statistics for the whole
/// database. Pure over the annotation fields and idempotent, so it can run
/// after every mutation before persisting.
///
/// Entries first get `most_frequent_lemma` assigned per
/// (lowercased surface, pos) group — ties go to the lexicographically
/// smallest lemma — then frequencies and translation unions are aggregated
/// over the refined (surface, most frequent lemma, pos) group.
pub fn recalculate(db: &mut BTreeMap<u32, WordEntry>) {
    if db.is_empty() {
        return;
    }

    // Lemma counts per (surface, pos); only fully resolved entries vote.
    let mut lemma_counts: HashMap<(String, String), HashMap<String, u32>> = HashMap::new();
    for entry in db.values() {
        if let (Some(lemma), Some(pos)) = (&entry.lemma, &entry.pos) {
            *lemma_counts
                .entry((entry.surface.to_lowercase(), pos.clone()))
                .or_default()
                .entry(lemma.clone())
                .or_insert(0) += 1;
        }
    }
    let winners: HashMap<(String, String), String> = lemma_counts
        .into_iter()
        .map(|(key, counts)| {
            let mut ranked: Vec<(String, u32)> = counts.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let (winner, _) = ranked.into_iter().next().expect("non-empty counts");
            (key, winner)
        })
        .collect();

    for entry in db.values_mut() {
        entry.most_frequent_lemma = match &entry.pos {
            Some(pos) => winners
                .get(&(entry.surface.to_lowercase(), pos.clone()))
                .cloned()
                .or_else(|| entry.lemma.clone()),
            None => entry.lemma.clone(),
        };
    }

    let mut aggregates: HashMap<GroupKey, GroupAgg> = HashMap::new();
    for entry in db.values() {
        let agg = aggregates.entry(refined_key(entry)).or_default();
        agg.total += 1;
        agg.translations
            .extend(entry.possible_translations.iter().cloned());
        agg.lemma_translations
            .extend(entry.lemma_translations.iter().cloned());
    }

    // Word-position order: BTreeMap iteration.
    let mut seen: HashSet<GroupKey> = HashSet::new();
    let mut running: HashMap<GroupKey, u32> = HashMap::new();
    for entry in db.values_mut() {
        let key = refined_key(entry);
        entry.first_inst = Some(seen.insert(key.clone()));
        let count = running.entry(key.clone()).or_insert(0);
        *count += 1;
        entry.freq_till_now = Some(*count);
        let agg = &aggregates[&key];
        entry.freq = Some(agg.total);
        entry.possible_translations = agg.translations.clone();
        entry.lemma_translations = agg.lemma_translations.clone();
    }
}
