use sha2::{Digest, Sha256};

// Unit separator: cannot appear in prompts, style labels, or numerals,
// so "ab" + "c" and "a" + "bc" never collide.
const PART_SEPARATOR: [u8; 1] = [0x1f];

/// Deterministic, order-sensitive key for a generation request.
///
/// Pure function of its inputs: the same parts in the same order always
/// produce the same key, across runs and platforms. Best-effort identity
/// only; a cache collision merely serves the wrong reconstructible asset,
/// so there is no collision handling.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update(PART_SEPARATOR);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}
