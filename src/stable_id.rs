//! Generation of short, permanent public identifiers.
//!
//! A `stable_id` is assigned once per catalog entry at insert time and
//! never changes again, even when the entry's content hash changes on
//! a later edit. It is what URLs, locks, and UI references key on
//! instead of the content hash. Grounded on the original's nanoid-based
//! generator (`stable_id.py`, referenced from `file_repository.py`'s
//! `insert_file`), reimplemented with `rand` rather than pulling in a
//! nanoid crate the rest of the pack doesn't otherwise use.

use std::collections::HashSet;

use rand::Rng;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const DEFAULT_LENGTH: usize = 8;
const MAX_ATTEMPTS: u32 = 64;

/// Generate a stable_id guaranteed not to collide with any of
/// `existing`. Starts at [`DEFAULT_LENGTH`] characters and grows by one
/// character every [`MAX_ATTEMPTS`] failed draws, so collisions become
/// exponentially less likely rather than looping forever.
pub fn generate_stable_id(existing: &HashSet<String>) -> String {
    let mut length = DEFAULT_LENGTH;
    let mut rng = rand::thread_rng();

    loop {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = random_id(&mut rng, length);
            if !existing.contains(&candidate) {
                return candidate;
            }
        }
        length += 1;
    }
}

fn random_id(rng: &mut impl Rng, length: usize) -> String {
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// True if `s` looks like a full SHA-256 content hash (64 lowercase hex
/// characters) rather than a stable_id. Used by lookups that accept
/// either form, matching the original's `resolve_file_id` length check.
pub fn looks_like_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_default_length_id() {
        let id = generate_stable_id(&HashSet::new());
        assert_eq!(id.len(), DEFAULT_LENGTH);
    }

    #[test]
    fn avoids_collisions() {
        let mut existing = HashSet::new();
        for _ in 0..1000 {
            let id = generate_stable_id(&existing);
            assert!(!existing.contains(&id));
            existing.insert(id);
        }
    }

    #[test]
    fn distinguishes_hash_from_stable_id() {
        let hash = "a".repeat(64);
        assert!(looks_like_content_hash(&hash));
        assert!(!looks_like_content_hash("abc12345"));
    }
}
