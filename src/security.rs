use rand::Rng;
use sha2::{Digest, Sha256};

pub const KEY_PREFIX: &str = "sj";

const RANDOM_BYTES: usize = 20;
const CHECKSUM_BYTES: usize = 4;
const ALPHABET: base32::Alphabet = base32::Alphabet::RFC4648 { padding: false };

/// Mints opaque API keys and recognises their shape.
///
/// Uniqueness comes from 160 bits of randomness, not from a collision
/// check against the store.
#[derive(Debug, Clone)]
pub struct KeyMinter {
    prefix: String,
}

impl Default for KeyMinter {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyMinter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    // Format: prefix_random_checksum
    pub fn mint(&self) -> String {
        let mut random_bytes = [0u8; RANDOM_BYTES];
        rand::thread_rng().fill(&mut random_bytes);

        let checksum = self.checksum(&random_bytes);
        format!(
            "{}_{}_{}",
            self.prefix,
            base32::encode(ALPHABET, &random_bytes),
            base32::encode(ALPHABET, &checksum)
        )
    }

    /// Cheap structural check so foreign strings never cost a store round trip.
    pub fn is_well_formed(&self, key: &str) -> bool {
        let mut parts = key.split('_');
        let (Some(prefix), Some(random_part), Some(checksum_part), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        if prefix != self.prefix {
            return false;
        }

        let Some(random_bytes) = base32::decode(ALPHABET, random_part) else {
            return false;
        };
        if random_bytes.len() != RANDOM_BYTES {
            return false;
        }

        match base32::decode(ALPHABET, checksum_part) {
            Some(provided) => provided == self.checksum(&random_bytes),
            None => false,
        }
    }

    fn checksum(&self, random_bytes: &[u8]) -> [u8; CHECKSUM_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(self.prefix.as_bytes());
        hasher.update(random_bytes);
        let digest = hasher.finalize();

        let mut checksum = [0u8; CHECKSUM_BYTES];
        checksum.copy_from_slice(&digest[..CHECKSUM_BYTES]);
        checksum
    }
}

/// Short, log-safe form of a key.
pub fn redact(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(10)
        .map(|(idx, _)| idx)
        .unwrap_or(key.len());
    &key[..end]
}
