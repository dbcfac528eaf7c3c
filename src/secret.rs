//! Credential helpers: bcrypt secret hashes and random identifiers.
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

pub use bcrypt::BcryptError;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@%&*-=";
const CLIENT_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const CLIENT_ID_LENGTH: usize = 8;
pub const MIN_SECRET_LENGTH: usize = 4;

/// bcrypt work factor used when none is configured.
pub const DEFAULT_HASH_COST: u32 = bcrypt::DEFAULT_COST;
pub const MIN_HASH_COST: u32 = 4;
pub const MAX_HASH_COST: u32 = 31;

/// Hashes a secret for storage as a `$2b$` bcrypt string.
pub fn hash_secret(secret: &str, cost: u32) -> Result<String, BcryptError> {
    bcrypt::hash(secret, cost)
}

/// Checks a plaintext secret against a stored hash. Malformed hashes never match.
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    match bcrypt::verify(secret, stored) {
        Ok(matches) => matches,
        Err(e) => {
            warn!(error = %e, "Secret verification error");
            false
        }
    }
}

/// Random secret with at least one lowercase, uppercase, digit and special
/// character. Lengths below `MIN_SECRET_LENGTH` are raised to it.
pub fn generate_secret(length: usize) -> String {
    let length = length.max(MIN_SECRET_LENGTH);
    let mut rng = rand::thread_rng();
    let mut chars: Vec<u8> = [LOWERCASE, UPPERCASE, DIGITS, SPECIAL]
        .iter()
        .map(|set| set[rng.gen_range(0..set.len())])
        .collect();
    let all: Vec<u8> = [LOWERCASE, UPPERCASE, DIGITS, SPECIAL].concat();
    while chars.len() < length {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}

/// Uppercase alphanumeric device client id.
pub fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CLIENT_ID_LENGTH)
        .map(|_| char::from(CLIENT_ID_CHARS[rng.gen_range(0..CLIENT_ID_CHARS.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_only_the_original_secret() {
        let stored = hash_secret("s3cret!", MIN_HASH_COST).unwrap();
        assert!(stored.starts_with("$2b$04$"));
        assert!(!stored.contains("s3cret!"));
        assert!(verify_secret("s3cret!", &stored));
        assert!(!verify_secret("s3cret?", &stored));
        assert_ne!(hash_secret("s3cret!", MIN_HASH_COST).unwrap(), stored);
    }

    #[test]
    fn configured_cost_is_recorded_in_the_hash() {
        let stored = hash_secret("pw", 5).unwrap();
        assert!(stored.starts_with("$2b$05$"));
        assert!(verify_secret("pw", &stored));
    }

    #[test]
    fn out_of_range_cost_is_an_error() {
        assert!(hash_secret("pw", MIN_HASH_COST - 1).is_err());
        assert!(hash_secret("pw", MAX_HASH_COST + 1).is_err());
    }

    #[test]
    fn malformed_hash_never_matches() {
        assert!(!verify_secret("x", "no-separator"));
        assert!(!verify_secret("x", "zz$abcd"));
        assert!(!verify_secret("x", "$2b$04$short"));
        assert!(!verify_secret("x", ""));
    }

    #[test]
    fn generated_secret_mixes_character_classes() {
        let secret = generate_secret(8);
        assert_eq!(secret.len(), 8);
        assert!(secret.bytes().any(|c| LOWERCASE.contains(&c)));
        assert!(secret.bytes().any(|c| UPPERCASE.contains(&c)));
        assert!(secret.bytes().any(|c| DIGITS.contains(&c)));
        assert!(secret.bytes().any(|c| SPECIAL.contains(&c)));
        assert_eq!(generate_secret(1).len(), MIN_SECRET_LENGTH);
    }

    #[test]
    fn client_id_shape() {
        let id = generate_client_id();
        assert_eq!(id.len(), CLIENT_ID_LENGTH);
        assert!(id.bytes().all(|c| CLIENT_ID_CHARS.contains(&c)));
    }
}
