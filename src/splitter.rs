use std::collections::BTreeSet;

use crate::tokenizer::{Token, TokenKind};

/// Batch sizing knobs for the split-point search.
#[derive(Clone, Copy, Debug)]
pub struct SplitConfig {
    pub target_words_per_batch: u32,
    pub backward_range: u32,
    pub forward_range: u32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            target_words_per_batch: 30,
            backward_range: 5,
            forward_range: 15,
        }
    }
}

/// A contiguous token range owning a disjoint set of word positions.
/// Ephemeral: rebuilt deterministically every run, never persisted.
#[derive(Clone, Debug)]
pub struct BatchBounds {
    pub index: usize,
    pub start_token: usize,
    pub end_token: usize,
    pub word_keys: BTreeSet<u32>,
    pub segment_id: String,
    pub start_word_key: u32,
    pub end_word_key: u32,
}

impl BatchBounds {
    /// A word-free trailing range synthesizes an inverted key pair
    /// (start > end) and is vacuously processed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.word_keys.is_empty()
    }
}

/// Boundary preference, lower is better: paragraph break, sentence-ending
/// punctuation, comma, anything else punctuation-like. Word and whitespace
/// tokens never qualify.
fn boundary_rank(token: &Token) -> Option<u8> {
    match token.kind {
        TokenKind::Newline => {
            if token.text.matches('\n').count() >= 2 {
                Some(0)
            } else {
                Some(3)
            }
        }
        TokenKind::Punctuation => {
            if token.text.contains(['.', '!', '?', ':', ';']) {
                Some(1)
            } else if token.text.contains(',') {
                Some(2)
            } else {
                Some(3)
            }
        }
        _ => None,
    }
}

fn words_consumed_through(tokens: &[Token], idx: usize) -> u32 {
    tokens[..=idx].iter().rev().find_map(|t| t.word_pos).unwrap_or(0)
}

/// Choose a strictly increasing sequence of token indices partitioning the
/// token list into batches of roughly `target_words_per_batch` words each,
/// cutting at natural breakpoints inside the configured search window.
/// The last split point is always the final token index.
pub fn find_split_points(tokens: &[Token], total_words: u32, cfg: SplitConfig) -> Vec<usize> {
    let mut split_points: Vec<usize> = Vec::new();
    if tokens.is_empty() || total_words == 0 {
        return split_points;
    }
    let last_idx = tokens.len() - 1;
    let target = cfg.target_words_per_batch.max(1);

    let mut current_word_count: u32 = 0;
    let mut last_split: Option<usize> = None;
    let mut guard = 0usize;

    while current_word_count < total_words {
        guard += 1;
        if guard > tokens.len() * 2 {
            // Pathological input; flush the remainder as a final batch.
            if last_split != Some(last_idx) {
                split_points.push(last_idx);
            }
            break;
        }

        let target_pos = current_word_count + target;
        if target_pos >= total_words {
            split_points.push(last_idx);
            break;
        }

        let min_pos = (current_word_count + 1).max(target_pos.saturating_sub(cfg.backward_range));
        let max_pos = total_words.min(target_pos + cfg.forward_range);
        let scan_from = last_split.map_or(0, |s| s + 1);

        // Map the word-position window onto token indices.
        let mut min_idx: Option<usize> = None;
        let mut max_idx: Option<usize> = None;
        let mut target_idx: Option<usize> = None;
        for (i, token) in tokens.iter().enumerate().skip(scan_from) {
            let Some(wp) = token.word_pos else { continue };
            if min_idx.is_none() && wp >= min_pos {
                min_idx = Some(i);
            }
            if target_idx.is_none() && wp >= target_pos {
                target_idx = Some(i);
            }
            if wp <= max_pos {
                max_idx = Some(i);
            } else {
                if max_idx.is_none() {
                    max_idx = Some(i.saturating_sub(1));
                }
                break;
            }
        }
        let min_idx = min_idx.unwrap_or(scan_from);
        let max_idx = max_idx.unwrap_or(last_idx);
        let target_idx = target_idx.unwrap_or(max_idx);

        // Scan outward from the target, alternating forward/backward. A later
        // candidate only wins with a strictly better rank, so nearness breaks
        // rank ties and forward beats backward at equal distance.
        let mut best: Option<(usize, u8)> = None;
        let radius = (target_idx - min_idx).max(max_idx - target_idx);
        for offset in 0..=radius {
            let forward = target_idx + offset;
            let mut candidates = [None, None];
            if forward <= max_idx {
                candidates[0] = Some(forward);
            }
            if offset > 0 {
                if let Some(backward) = target_idx.checked_sub(offset) {
                    if backward >= min_idx {
                        candidates[1] = Some(backward);
                    }
                }
            }
            for idx in candidates.into_iter().flatten() {
                if last_split.is_some_and(|s| idx <= s) {
                    continue;
                }
                if let Some(rank) = boundary_rank(&tokens[idx]) {
                    if best.map_or(true, |(_, b)| rank < b) {
                        best = Some((idx, rank));
                    }
                }
            }
        }

        let mut chosen = match best {
            Some((idx, _)) => idx,
            None => {
                // No natural breakpoint in the window: cut at the word-token
                // boundary at/after the target, absorbing trailing non-words.
                let mut idx = target_idx;
                while idx + 1 <= max_idx
                    && idx + 1 < tokens.len()
                    && tokens[idx + 1].kind != TokenKind::Word
                {
                    idx += 1;
                }
                idx
            }
        };

        if last_split.is_some_and(|s| chosen <= s) {
            // Force progress past the next unconsumed word token.
            let next_word = (scan_from..tokens.len()).find(|&i| tokens[i].kind == TokenKind::Word);
            match next_word {
                Some(mut i) => {
                    while i + 1 < tokens.len() && tokens[i + 1].kind != TokenKind::Word {
                        i += 1;
                    }
                    chosen = i;
                }
                None => chosen = last_idx,
            }
            if last_split.is_some_and(|s| chosen <= s) {
                if last_split != Some(last_idx) {
                    split_points.push(last_idx);
                }
                break;
            }
        }

        split_points.push(chosen);
        last_split = Some(chosen);
        current_word_count = words_consumed_through(tokens, chosen);
    }

    split_points
}

/// Derive per-batch boundaries from consecutive split points.
pub fn batch_bounds(tokens: &[Token], split_points: &[usize]) -> Vec<BatchBounds> {
    let mut out = Vec::with_capacity(split_points.len());
    let mut start_token = 0usize;
    for (i, &end_token) in split_points.iter().enumerate() {
        let mut word_keys = BTreeSet::new();
        for token in &tokens[start_token..=end_token] {
            if let Some(wp) = token.word_pos {
                word_keys.insert(wp);
            }
        }
        let (start_key, end_key) = match (word_keys.first(), word_keys.last()) {
            (Some(&s), Some(&e)) => (s, e),
            _ => {
                let prev = tokens[..start_token]
                    .iter()
                    .rev()
                    .find_map(|t| t.word_pos)
                    .unwrap_or(0);
                (prev + 1, prev)
            }
        };
        out.push(BatchBounds {
            index: i + 1,
            start_token,
            end_token,
            segment_id: format!("seg-{start_key}-{end_key}"),
            word_keys,
            start_word_key: start_key,
            end_word_key: end_key,
        });
        start_token = end_token + 1;
    }
    out
}

/// Exact batch text: the concatenation of every token in the range.
pub fn batch_text(tokens: &[Token], bounds: &BatchBounds) -> String {
    tokens[bounds.start_token..=bounds.end_token]
        .iter()
        .map(|t| t.text.as_str())
        .collect()
}
