// Span signals: canonical text, content hashes and context signatures.
//
// The hash itself is plain SHA-256. What is bespoke is the canonical form:
// NFC text with LF line endings, composed into versioned signal strings so a
// context hash can never collide with a window or structure hash.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Hex-encoded SHA-256 digest.
pub type SignalHash = String;

const CONTEXT_SIGNAL_VERSION: &str = "tether.span.v1";
const WINDOW_SIGNAL_VERSION: &str = "tether.window.v1";
const STRUCTURE_SIGNAL_VERSION: &str = "tether.structure.v1";

/// Compute the SHA-256 hash of the given bytes, returned as a lowercase hex string.
pub fn sha256_hex(content: &[u8]) -> SignalHash {
    let digest = Sha256::digest(content);
    hex_encode(&digest)
}

/// NFC-normalize and fold CRLF / lone CR to LF.
pub fn canonicalize_text(text: &str) -> String {
    let folded = text.replace("\r\n", "\n").replace('\r', "\n");
    folded.nfc().collect()
}

/// Content hash of a span's text within its block.
pub fn compute_context_hash(block_id: &str, text: &str) -> SignalHash {
    let signal = format!(
        "{CONTEXT_SIGNAL_VERSION}\nblock_id={block_id}\ntext={}",
        canonicalize_text(text)
    );
    sha256_hex(signal.as_bytes())
}

/// Hash of the span together with its surrounding text.
pub fn compute_window_hash(block_id: &str, left: &str, span: &str, right: &str) -> SignalHash {
    let signal = format!(
        "{WINDOW_SIGNAL_VERSION}\nblock_id={block_id}\nleft={}\nspan={}\nright={}",
        canonicalize_text(left),
        canonicalize_text(span),
        canonicalize_text(right)
    );
    sha256_hex(signal.as_bytes())
}

/// Hash of the block's structural shape (type and ancestor path).
pub fn compute_structure_hash(block_id: &str, block_type: &str, parent_path: &[&str]) -> SignalHash {
    let signal = format!(
        "{STRUCTURE_SIGNAL_VERSION}\nblock_id={block_id}\ntype={block_type}\nparents={}",
        parent_path.join("/")
    );
    sha256_hex(signal.as_bytes())
}

/// `prefix|suffix` signature around a char offset, `window` chars each side.
///
/// Offsets past the end clamp to the end of the text.
pub fn context_signature(text: &str, offset: usize, window: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    context_signature_chars(&chars, offset, window)
}

pub(crate) fn context_signature_chars(chars: &[char], offset: usize, window: usize) -> String {
    let offset = offset.min(chars.len());
    let start = offset.saturating_sub(window);
    let end = (offset + window).min(chars.len());

    let mut signature = String::with_capacity((end - start) + 1);
    signature.extend(&chars[start..offset]);
    signature.push('|');
    signature.extend(&chars[offset..end]);
    signature
}

/// Jaccard similarity of the character n-gram sets of `a` and `b`.
///
/// Strings shorter than `n` contribute themselves as a single gram. Two empty
/// strings are identical.
pub fn ngram_jaccard(a: &str, b: &str, n: usize) -> f64 {
    let left = ngrams(a, n.max(1));
    let right = ngrams(b, n.max(1));
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn ngrams(value: &str, n: usize) -> HashSet<String> {
    let chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        return HashSet::new();
    }
    if chars.len() < n {
        return HashSet::from([chars.iter().collect::<String>()]);
    }
    chars.windows(n).map(|gram| gram.iter().collect()).collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
