// Fuzzy text relocation.
//
// Slides windows of several sizes across candidate blocks near the anchor's
// original block and scores them with normalized Levenshtein similarity.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;
use tracing::debug;

use crate::anchor::Anchor;
use crate::gateway::provider::DocumentContentAccessor;
use crate::mapping::BlockMapping;

use super::{RelocationDebug, RelocationMethod, RelocationOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzyRelocationConfig {
    /// Blocks searched on each side of every seed block, in document order.
    pub search_radius: usize,
    pub similarity_threshold: f64,
    /// Window lengths as multiples of the original span length.
    pub window_scales: Vec<f64>,
    /// Whole-block comparison runs when `|block_len - span_len| <= tolerance * span_len`.
    pub whole_block_tolerance: f64,
}

impl Default for FuzzyRelocationConfig {
    fn default() -> Self {
        Self {
            search_radius: 3,
            similarity_threshold: 0.7,
            window_scales: vec![0.8, 1.0, 1.2, 1.5],
            whole_block_tolerance: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    block_rank: usize,
    block_id: String,
    start: usize,
    len: usize,
    score: f64,
}

impl Candidate {
    fn overlaps(&self, other: &Candidate) -> bool {
        self.block_id == other.block_id
            && self.start < other.start + other.len
            && other.start < self.start + self.len
    }
}

/// Search blocks derived from the anchor's block (plus a radius around them)
/// for the text the anchor originally pointed at.
pub fn fuzzy_relocate_anchor(
    anchor: &Anchor,
    original_text: &str,
    mapping: Option<&BlockMapping>,
    accessor: &dyn DocumentContentAccessor,
    config: &FuzzyRelocationConfig,
) -> RelocationOutcome {
    let needle: Vec<char> = original_text.chars().collect();
    let mut debug = RelocationDebug::default();
    if needle.is_empty() {
        return RelocationOutcome::failed(debug);
    }

    let blocks = candidate_blocks(anchor, mapping, accessor, config.search_radius);
    let mut candidates: Vec<Candidate> = Vec::new();

    for (block_rank, block_id) in blocks.iter().enumerate() {
        let Some(text) = accessor.block_content(block_id) else { continue };
        debug.blocks_searched += 1;
        let haystack: Vec<char> = text.chars().collect();

        let mut scored = score_windows(&needle, &haystack, config, &mut debug);
        if let Some(whole) = score_whole_block(&needle, &haystack, config, &mut debug) {
            scored.push(whole);
        }

        let mut accepted: Vec<Candidate> = Vec::new();
        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        for (start, len, score) in scored {
            if score < config.similarity_threshold {
                continue;
            }
            let candidate = Candidate { block_rank, block_id: block_id.clone(), start, len, score };
            if accepted.iter().all(|kept| !kept.overlaps(&candidate)) {
                accepted.push(candidate);
            }
        }
        candidates.extend(accepted);
    }

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.block_rank.cmp(&b.block_rank))
            .then(a.start.cmp(&b.start))
    });

    match candidates.into_iter().next() {
        Some(best) => RelocationOutcome {
            anchor: Some(anchor.moved_to(best.block_id, best.start)),
            confidence: best.score,
            method: RelocationMethod::FuzzyText,
            matched_len: Some(best.len),
            debug,
        },
        None => {
            let candidates_considered = debug.candidates_considered;
            let best_score = debug.best_score;
            debug!(
                anchor = %anchor,
                candidates = candidates_considered,
                best_score = best_score,
                "fuzzy relocation found no match above threshold"
            );
            RelocationOutcome::failed(debug)
        }
    }
}

/// Derived blocks and the anchor's own block, each widened by `radius`,
/// deduplicated in first-seen order.
fn candidate_blocks(
    anchor: &Anchor,
    mapping: Option<&BlockMapping>,
    accessor: &dyn DocumentContentAccessor,
    radius: usize,
) -> Vec<String> {
    let mut seeds: Vec<&str> = mapping
        .map(|m| m.derived_blocks_from(&anchor.block_id).iter().map(String::as_str).collect())
        .unwrap_or_default();
    seeds.push(&anchor.block_id);

    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for seed in seeds {
        for block_id in accessor.blocks_in_radius(seed, radius) {
            if seen.insert(block_id.clone()) {
                blocks.push(block_id);
            }
        }
    }
    blocks
}

fn score_windows(
    needle: &[char],
    haystack: &[char],
    config: &FuzzyRelocationConfig,
    debug: &mut RelocationDebug,
) -> Vec<(usize, usize, f64)> {
    let original: String = needle.iter().collect();
    let mut scored = Vec::new();
    let mut seen_lengths = HashSet::new();

    for scale in &config.window_scales {
        let len = ((needle.len() as f64) * scale).round().max(1.0) as usize;
        if len > haystack.len() || !seen_lengths.insert(len) {
            continue;
        }
        for start in 0..=haystack.len() - len {
            let window: String = haystack[start..start + len].iter().collect();
            let score = normalized_levenshtein(&original, &window);
            debug.candidates_considered += 1;
            debug.best_score = debug.best_score.max(score);
            scored.push((start, len, score));
        }
    }
    scored
}

fn score_whole_block(
    needle: &[char],
    haystack: &[char],
    config: &FuzzyRelocationConfig,
    debug: &mut RelocationDebug,
) -> Option<(usize, usize, f64)> {
    if haystack.is_empty() {
        return None;
    }
    let diff = needle.len().abs_diff(haystack.len()) as f64;
    if diff > config.whole_block_tolerance * needle.len() as f64 {
        return None;
    }

    let original: String = needle.iter().collect();
    let block: String = haystack.iter().collect();
    let score = normalized_levenshtein(&original, &block);
    debug.candidates_considered += 1;
    debug.best_score = debug.best_score.max(score);
    Some((0, haystack.len(), score))
}
