// Block-structured Y.Doc wrapper.
//
// Layout: a root array `block_order` of block ids and one root text per
// block named `block:<id>`. Offsets on this API count chars; yrs indexes
// UTF-8 bytes, so every call converts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Array, ArrayRef, Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::frontier::state_vector_tag;
use crate::gateway::provider::DocumentContentAccessor;

const BLOCK_ORDER: &str = "block_order";
const BLOCK_TEXT_PREFIX: &str = "block:";

pub struct BlockDocument {
    doc: Doc,
}

impl BlockDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Load a document from a binary state (full snapshot).
    pub fn from_state(data: &[u8]) -> Result<Self, BlockDocError> {
        let doc = Doc::new();
        let update = Update::decode_v1(data).map_err(|e| BlockDocError::Decode(e.to_string()))?;
        doc.transact_mut().apply_update(update).map_err(|e| BlockDocError::Apply(e.to_string()))?;
        Ok(Self { doc })
    }

    pub fn apply_update(&self, data: &[u8]) -> Result<(), BlockDocError> {
        let update = Update::decode_v1(data).map_err(|e| BlockDocError::Decode(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| BlockDocError::Apply(e.to_string()))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Changes since the given remote state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, BlockDocError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| BlockDocError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// `sv1:` frontier tag of the current state.
    pub fn frontier_tag(&self) -> String {
        state_vector_tag(&self.doc.transact().state_vector())
    }

    /// Append a block at the end of the document.
    pub fn append_block(&self, block_id: &str, text: &str) {
        let order = self.order_ref();
        let ytext = self.text_ref(block_id);
        let mut txn = self.doc.transact_mut();
        let len = order.len(&txn);
        order.insert(&mut txn, len, block_id);
        ytext.insert(&mut txn, 0, text);
    }

    /// Remove a block from the order. Its text stays in the doc history.
    pub fn remove_block(&self, block_id: &str) -> bool {
        let order = self.order_ref();
        let Some(index) = self.block_order().iter().position(|id| id == block_id) else {
            return false;
        };
        let mut txn = self.doc.transact_mut();
        order.remove(&mut txn, index as u32);
        true
    }

    pub fn insert_text(&self, block_id: &str, char_offset: usize, content: &str) {
        let ytext = self.text_ref(block_id);
        let current = self.block_text(block_id);
        let index = byte_index(&current, char_offset);
        let mut txn = self.doc.transact_mut();
        ytext.insert(&mut txn, index, content);
    }

    pub fn remove_text(&self, block_id: &str, char_offset: usize, char_len: usize) {
        let ytext = self.text_ref(block_id);
        let current = self.block_text(block_id);
        let start = byte_index(&current, char_offset);
        let end = byte_index(&current, char_offset + char_len);
        let mut txn = self.doc.transact_mut();
        ytext.remove_range(&mut txn, start, end - start);
    }

    pub fn block_order(&self) -> Vec<String> {
        let order = self.order_ref();
        let txn = self.doc.transact();
        order.iter(&txn).map(|value| value.to_string(&txn)).collect()
    }

    pub fn block_text(&self, block_id: &str) -> String {
        let ytext = self.text_ref(block_id);
        ytext.get_string(&self.doc.transact())
    }

    /// Read-only copy of the current block order and texts.
    pub fn snapshot(&self) -> BlockSnapshot {
        let order = self.block_order();
        let texts = order.iter().map(|id| (id.clone(), self.block_text(id))).collect();
        BlockSnapshot { order, texts }
    }

    pub fn inner(&self) -> &Doc {
        &self.doc
    }

    fn order_ref(&self) -> ArrayRef {
        self.doc.get_or_insert_array(BLOCK_ORDER)
    }

    fn text_ref(&self, block_id: &str) -> TextRef {
        self.doc.get_or_insert_text(format!("{BLOCK_TEXT_PREFIX}{block_id}").as_str())
    }
}

impl Default for BlockDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable block order + texts captured from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub order: Vec<String>,
    pub texts: HashMap<String, String>,
}

impl BlockSnapshot {
    pub fn from_blocks<I, K, V>(blocks: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut snapshot = Self::default();
        for (id, text) in blocks {
            let id = id.into();
            snapshot.order.push(id.clone());
            snapshot.texts.insert(id, text.into());
        }
        snapshot
    }
}

impl DocumentContentAccessor for BlockSnapshot {
    fn block_content(&self, block_id: &str) -> Option<&str> {
        self.texts.get(block_id).map(String::as_str)
    }

    fn block_order(&self) -> &[String] {
        &self.order
    }
}

fn byte_index(text: &str, char_offset: usize) -> u32 {
    let byte = text.char_indices().nth(char_offset).map(|(i, _)| i).unwrap_or(text.len());
    byte as u32
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockDocError {
    #[error("failed to decode Yjs payload: {0}")]
    Decode(String),
    #[error("failed to apply Yjs update: {0}")]
    Apply(String),
}
