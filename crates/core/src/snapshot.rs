// In-memory document snapshot.
//
// Serves every provider trait the gateway and relocation engine consume
// from one immutable value. Deserializable from JSON fixtures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

use crate::crdt::BlockDocument;
use crate::gateway::provider::{DocumentContentAccessor, GatewayDocumentProvider, RelocationProvider};
use crate::gateway::types::SpanState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub doc_id: String,
    pub frontier_tag: String,
    #[serde(default)]
    pub block_order: Vec<String>,
    #[serde(default)]
    pub blocks: HashMap<String, String>,
    #[serde(default)]
    pub spans: Vec<SpanState>,
}

impl DocumentSnapshot {
    pub fn new(doc_id: impl Into<String>, frontier_tag: impl Into<String>) -> Self {
        Self { doc_id: doc_id.into(), frontier_tag: frontier_tag.into(), ..Default::default() }
    }

    /// Capture the block order, texts and frontier of a live document.
    pub fn from_block_document(doc_id: impl Into<String>, document: &BlockDocument) -> Self {
        let snapshot = document.snapshot();
        Self {
            doc_id: doc_id.into(),
            frontier_tag: document.frontier_tag(),
            block_order: snapshot.order,
            blocks: snapshot.texts,
            spans: Vec::new(),
        }
    }

    pub fn with_block(mut self, block_id: impl Into<String>, text: impl Into<String>) -> Self {
        let block_id = block_id.into();
        if !self.blocks.contains_key(&block_id) {
            self.block_order.push(block_id.clone());
        }
        self.blocks.insert(block_id, text.into());
        self
    }

    /// Add or replace a span state, keyed by span id.
    pub fn with_span(mut self, span: SpanState) -> Self {
        match self.spans.iter_mut().find(|existing| existing.span_id == span.span_id) {
            Some(existing) => *existing = span,
            None => self.spans.push(span),
        }
        self
    }

    fn serves(&self, doc_id: &str) -> bool {
        self.doc_id == doc_id
    }
}

impl GatewayDocumentProvider for DocumentSnapshot {
    fn frontier_tag(&self) -> String {
        self.frontier_tag.clone()
    }

    fn span_state(&self, span_id: &str) -> Option<SpanState> {
        self.spans.iter().find(|span| span.span_id == span_id).cloned()
    }

    fn all_span_states(&self) -> HashMap<String, SpanState> {
        self.spans.iter().map(|span| (span.span_id.clone(), span.clone())).collect()
    }

    fn document_exists(&self, doc_id: &str) -> bool {
        self.serves(doc_id)
    }
}

impl DocumentContentAccessor for DocumentSnapshot {
    fn block_content(&self, block_id: &str) -> Option<&str> {
        self.blocks.get(block_id).map(String::as_str)
    }

    fn block_order(&self) -> &[String] {
        &self.block_order
    }
}

impl RelocationProvider for DocumentSnapshot {
    /// Verified spans win over unverified ones with the same hash.
    fn find_by_context_hash(&self, doc_id: &str, context_hash: &str) -> Option<SpanState> {
        if !self.serves(doc_id) {
            return None;
        }
        let mut matches = self.spans.iter().filter(|span| span.context_hash == context_hash);
        let first = matches.next()?;
        if first.is_verified {
            return Some(first.clone());
        }
        Some(matches.find(|span| span.is_verified).unwrap_or(first).clone())
    }

    fn find_by_fuzzy_text(&self, doc_id: &str, text: &str, threshold: f64) -> Option<(SpanState, f64)> {
        if !self.serves(doc_id) {
            return None;
        }
        self.spans
            .iter()
            .map(|span| (span, normalized_levenshtein(text, &span.text)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|(left, left_score), (right, right_score)| {
                left_score.total_cmp(right_score).then_with(|| right.span_id.cmp(&left.span_id))
            })
            .map(|(span, score)| (span.clone(), score))
    }
}
