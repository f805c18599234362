// Frontier tag comparison.
//
// A frontier tag summarizes the causal history a client saw. `sv1:` tags are
// base64url-encoded yrs state vectors and compare component-wise; simple
// version tags like `v12` compare numerically when their prefixes agree.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::StateVector;

pub const STATE_VECTOR_TAG_PREFIX: &str = "sv1:";

/// How a client frontier relates to the server frontier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrontierOrdering {
    Equal,
    /// Client has seen a prefix of the server history.
    Behind,
    /// Client claims history the server does not have.
    Ahead,
    Diverged,
}

impl FrontierOrdering {
    /// Only `equal` and `behind` are safe to apply against the server state.
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Equal | Self::Behind)
    }
}

impl fmt::Display for FrontierOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => f.write_str("equal"),
            Self::Behind => f.write_str("behind"),
            Self::Ahead => f.write_str("ahead"),
            Self::Diverged => f.write_str("diverged"),
        }
    }
}

/// Encode a state vector as a frontier tag.
pub fn state_vector_tag(state_vector: &StateVector) -> String {
    use yrs::updates::encoder::Encode;
    format!("{STATE_VECTOR_TAG_PREFIX}{}", URL_SAFE_NO_PAD.encode(state_vector.encode_v1()))
}

pub fn decode_state_vector_tag(tag: &str) -> Option<StateVector> {
    let encoded = tag.strip_prefix(STATE_VECTOR_TAG_PREFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    StateVector::decode_v1(&bytes).ok()
}

/// Compare a client frontier tag against the server's.
pub fn compare_frontier_tags(client: &str, server: &str) -> FrontierOrdering {
    if client == server {
        return FrontierOrdering::Equal;
    }

    if let (Some(client_sv), Some(server_sv)) =
        (decode_state_vector_tag(client), decode_state_vector_tag(server))
    {
        return compare_state_vectors(&client_sv, &server_sv);
    }

    match (split_version(client), split_version(server)) {
        (Some((client_prefix, client_n)), Some((server_prefix, server_n)))
            if client_prefix == server_prefix =>
        {
            match client_n.cmp(&server_n) {
                std::cmp::Ordering::Equal => FrontierOrdering::Equal,
                std::cmp::Ordering::Less => FrontierOrdering::Behind,
                std::cmp::Ordering::Greater => FrontierOrdering::Ahead,
            }
        }
        _ => FrontierOrdering::Diverged,
    }
}

pub fn compare_state_vectors(client: &StateVector, server: &StateVector) -> FrontierOrdering {
    let client_within = client.iter().all(|(id, clock)| *clock <= server.get(id));
    let server_within = server.iter().all(|(id, clock)| *clock <= client.get(id));

    match (client_within, server_within) {
        (true, true) => FrontierOrdering::Equal,
        (true, false) => FrontierOrdering::Behind,
        (false, true) => FrontierOrdering::Ahead,
        (false, false) => FrontierOrdering::Diverged,
    }
}

/// `"v12"` -> `("v", 12)`. Tags without a trailing number yield `None`.
fn split_version(tag: &str) -> Option<(&str, u64)> {
    let digits_start = tag.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits_start == tag.len() {
        return None;
    }
    let number = tag[digits_start..].parse().ok()?;
    Some((&tag[..digits_start], number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, Options, ReadTxn, Text, Transact};

    fn doc_with_client(client_id: u64) -> Doc {
        Doc::with_options(Options { client_id, ..Default::default() })
    }

    fn insert(doc: &Doc, content: &str) {
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
    }

    fn tag(doc: &Doc) -> String {
        state_vector_tag(&doc.transact().state_vector())
    }

    #[test]
    fn version_tags_compare_numerically() {
        assert_eq!(compare_frontier_tags("v1", "v1"), FrontierOrdering::Equal);
        assert_eq!(compare_frontier_tags("v1", "v2"), FrontierOrdering::Behind);
        assert_eq!(compare_frontier_tags("v2", "v1"), FrontierOrdering::Ahead);
        assert_eq!(compare_frontier_tags("v9", "v10"), FrontierOrdering::Behind);
    }

    #[test]
    fn unrelated_tags_diverge() {
        assert_eq!(compare_frontier_tags("v1", "r1"), FrontierOrdering::Diverged);
        assert_eq!(compare_frontier_tags("abc", "def"), FrontierOrdering::Diverged);
    }

    #[test]
    fn state_vector_tags_follow_causality() {
        let server = doc_with_client(1);
        insert(&server, "hello");
        let before = tag(&server);
        insert(&server, " world");
        let after = tag(&server);

        assert_eq!(compare_frontier_tags(&before, &after), FrontierOrdering::Behind);
        assert_eq!(compare_frontier_tags(&after, &before), FrontierOrdering::Ahead);
        assert_eq!(compare_frontier_tags(&after, &after), FrontierOrdering::Equal);
    }

    #[test]
    fn concurrent_state_vectors_diverge() {
        let a = doc_with_client(1);
        let b = doc_with_client(2);
        insert(&a, "from a");
        insert(&b, "from b");
        assert_eq!(compare_frontier_tags(&tag(&a), &tag(&b)), FrontierOrdering::Diverged);
    }

    #[test]
    fn state_vector_tag_round_trips() {
        let doc = doc_with_client(7);
        insert(&doc, "x");
        let sv = doc.transact().state_vector();
        let decoded = decode_state_vector_tag(&state_vector_tag(&sv)).expect("tag should decode");
        assert_eq!(decoded, sv);
    }

    #[test]
    fn acceptable_orderings() {
        assert!(FrontierOrdering::Equal.is_acceptable());
        assert!(FrontierOrdering::Behind.is_acceptable());
        assert!(!FrontierOrdering::Ahead.is_acceptable());
        assert!(!FrontierOrdering::Diverged.is_acceptable());
    }
}
