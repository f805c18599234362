// Context-signature relocation.
//
// Matches the `prefix|suffix` signature captured around an anchor against
// every offset of candidate blocks, nearest blocks first.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anchor::Anchor;
use crate::gateway::provider::DocumentContentAccessor;
use crate::hash::{context_signature_chars, ngram_jaccard};

use super::{RelocationDebug, RelocationMethod, RelocationOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextRelocationConfig {
    /// Chars captured on each side of the anchor.
    pub context_window: usize,
    pub ngram: usize,
    pub min_similarity: f64,
    /// Stop scanning once a block yields a match at least this good.
    pub early_exit_confidence: f64,
}

impl Default for ContextRelocationConfig {
    fn default() -> Self {
        Self { context_window: 16, ngram: 3, min_similarity: 0.6, early_exit_confidence: 0.95 }
    }
}

/// Block indices alternating outward from `center`:
/// `center, center+1, center-1, center+2, center-2, ...`, clipped to `0..total`.
pub fn get_search_order(center: usize, total: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let center = center.min(total - 1);
    let mut order = Vec::with_capacity(total);
    order.push(center);

    let mut distance = 1;
    while order.len() < total {
        if center + distance < total {
            order.push(center + distance);
        }
        if distance <= center {
            order.push(center - distance);
        }
        distance += 1;
    }
    order
}

/// Relocate by context signature. An exact signature hit returns at once
/// with confidence 1.0; otherwise the best n-gram similarity above
/// `min_similarity` wins.
///
/// The search centers on the anchor's block when it still exists, else on
/// `block_index_hint`, else on the first block.
pub fn relocate_anchor_fuzzy(
    anchor: &Anchor,
    original_context: &str,
    block_index_hint: Option<usize>,
    accessor: &dyn DocumentContentAccessor,
    config: &ContextRelocationConfig,
) -> RelocationOutcome {
    let order = accessor.block_order();
    let center = order
        .iter()
        .position(|id| *id == anchor.block_id)
        .or(block_index_hint)
        .unwrap_or(0);

    let mut debug = RelocationDebug::default();
    let mut best: Option<(String, usize, f64)> = None;

    for index in get_search_order(center, order.len()) {
        let block_id = &order[index];
        let Some(text) = accessor.block_content(block_id) else { continue };
        debug.blocks_searched += 1;
        let chars: Vec<char> = text.chars().collect();

        for offset in 0..=chars.len() {
            let signature = context_signature_chars(&chars, offset, config.context_window);
            debug.candidates_considered += 1;

            if signature == original_context {
                debug.best_score = 1.0;
                return RelocationOutcome {
                    anchor: Some(anchor.moved_to(block_id.clone(), offset)),
                    confidence: 1.0,
                    method: RelocationMethod::ContextHash,
                    matched_len: None,
                    debug,
                };
            }

            let score = ngram_jaccard(&signature, original_context, config.ngram);
            if best.as_ref().map_or(true, |(_, _, current)| score > *current) {
                best = Some((block_id.clone(), offset, score));
                debug.best_score = score;
            }
        }

        if debug.best_score >= config.early_exit_confidence {
            break;
        }
    }

    match best {
        Some((block_id, offset, score)) if score >= config.min_similarity => RelocationOutcome {
            anchor: Some(anchor.moved_to(block_id, offset)),
            confidence: score,
            method: RelocationMethod::ContextHash,
            matched_len: None,
            debug,
        },
        _ => {
            let best_score = debug.best_score;
            debug!(anchor = %anchor, best_score = best_score, "context relocation failed");
            RelocationOutcome::failed(debug)
        }
    }
}
