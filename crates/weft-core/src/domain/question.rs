//! Question hashing for resume idempotence.

use sha2::{Digest, Sha256};

const HASH_LEN: usize = 12;

/// Collapses runs of whitespace and trims, so cosmetic edits to a
/// question do not change its identity.
pub fn normalize_question(question: &str) -> String {
    question.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First 12 hex chars of SHA-256 over the normalised question.
pub fn question_hash(question: &str) -> String {
    let digest = Sha256::digest(normalize_question(question).as_bytes());
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
