// Read-only views of document state consumed by the gateway.
//
// Implementations hand out immutable snapshots; nothing in the gateway
// mutates document or span state through these traits.

use std::collections::HashMap;

use crate::frontier::{compare_frontier_tags, FrontierOrdering};

use super::types::SpanState;

pub trait GatewayDocumentProvider {
    fn frontier_tag(&self) -> String;

    fn compare_frontiers(&self, client: &str, server: &str) -> FrontierOrdering {
        compare_frontier_tags(client, server)
    }

    fn span_state(&self, span_id: &str) -> Option<SpanState>;

    fn span_states(&self, span_ids: &[&str]) -> HashMap<String, SpanState> {
        span_ids
            .iter()
            .filter_map(|id| self.span_state(id).map(|state| (id.to_string(), state)))
            .collect()
    }

    fn all_span_states(&self) -> HashMap<String, SpanState>;

    fn document_exists(&self, doc_id: &str) -> bool;
}

/// Block text access for the fuzzy relocation paths.
pub trait DocumentContentAccessor {
    fn block_content(&self, block_id: &str) -> Option<&str>;

    fn block_order(&self) -> &[String];

    /// `block_id` plus up to `radius` blocks on each side, in document order.
    fn blocks_in_radius(&self, block_id: &str, radius: usize) -> Vec<String> {
        let order = self.block_order();
        let Some(index) = order.iter().position(|id| id == block_id) else {
            return Vec::new();
        };
        let start = index.saturating_sub(radius);
        let end = (index + radius + 1).min(order.len());
        order[start..end].to_vec()
    }

    /// Block containing a document-level char offset, with the offset inside it.
    fn block_at_position(&self, offset: usize) -> Option<(String, usize)> {
        let mut base = 0usize;
        for block_id in self.block_order() {
            let len = self.block_content(block_id).map(|text| text.chars().count()).unwrap_or(0);
            if offset < base + len {
                return Some((block_id.clone(), offset - base));
            }
            base += len;
        }
        None
    }
}

/// Span lookup backends. Each method is optional; a backend that returns
/// `None` makes the matching relocation level unreachable.
pub trait RelocationProvider {
    fn find_by_context_hash(&self, _doc_id: &str, _context_hash: &str) -> Option<SpanState> {
        None
    }

    /// Best span whose text is at least `threshold` similar to `text`.
    fn find_by_fuzzy_text(
        &self,
        _doc_id: &str,
        _text: &str,
        _threshold: f64,
    ) -> Option<(SpanState, f64)> {
        None
    }

    fn find_by_semantic(&self, _doc_id: &str, _text: &str) -> Option<(SpanState, f64)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blocks {
        order: Vec<String>,
        texts: HashMap<String, String>,
    }

    impl DocumentContentAccessor for Blocks {
        fn block_content(&self, block_id: &str) -> Option<&str> {
            self.texts.get(block_id).map(String::as_str)
        }

        fn block_order(&self) -> &[String] {
            &self.order
        }
    }

    fn blocks() -> Blocks {
        let pairs = [("a", "one"), ("b", "two"), ("c", "three"), ("d", "four")];
        Blocks {
            order: pairs.iter().map(|(id, _)| id.to_string()).collect(),
            texts: pairs.iter().map(|(id, text)| (id.to_string(), text.to_string())).collect(),
        }
    }

    #[test]
    fn radius_is_clipped_to_document() {
        let doc = blocks();
        assert_eq!(doc.blocks_in_radius("a", 1), vec!["a", "b"]);
        assert_eq!(doc.blocks_in_radius("c", 1), vec!["b", "c", "d"]);
        assert!(doc.blocks_in_radius("zz", 2).is_empty());
    }

    #[test]
    fn position_lookup_walks_block_lengths() {
        let doc = blocks();
        assert_eq!(doc.block_at_position(0), Some(("a".into(), 0)));
        assert_eq!(doc.block_at_position(4), Some(("b".into(), 1)));
        assert_eq!(doc.block_at_position(6), Some(("c".into(), 0)));
        assert_eq!(doc.block_at_position(100), None);
    }
}
