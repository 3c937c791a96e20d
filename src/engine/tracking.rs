use chrono::{DateTime, Utc};
use rand::Rng;

const PREFIX: &str = "FKS";
const SUFFIX_LENGTH: usize = 6;
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Human-readable order identifiers, e.g. `FKS-261019-7KQ2XM`.
///
/// Codes are random, so uniqueness is settled by the store's tracking index;
/// callers regenerate on collision.
#[derive(Debug, Clone, Default)]
pub struct TrackingCodeGenerator;

impl TrackingCodeGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, now: DateTime<Utc>) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();

        format!("{PREFIX}-{}-{suffix}", now.format("%y%m%d"))
    }
}
