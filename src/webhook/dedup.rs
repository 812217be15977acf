use sha2::{Digest, Sha256};

use crate::models::provider::Provider;

/// Deterministic identity of a logical delivery. Providers redeliver the
/// same event with identical (provider, transaction, event-type) triples,
/// so hashing the triple gives a stable dedup key regardless of arrival
/// order or payload cosmetics.
pub fn dedup_key(provider: Provider, transaction_id: Option<&str>, event_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(transaction_id.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_bytes());
    hex::encode(hasher.finalize())
}
