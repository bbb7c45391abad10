//! Structured cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identity of a cached model client.
///
/// Two adapters share a client only when provider, model, TTL and the hashed connection
/// settings (API key, endpoint) all match. The raw credential is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelCacheKey {
    pub provider: String,
    pub model: String,
    pub ttl: Duration,
    pub fingerprint: String,
}

impl ModelCacheKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, ttl: Duration) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ttl,
            fingerprint: String::new(),
        }
    }

    /// Fold the given settings into the key. Order of insertion does not matter.
    pub fn with_settings<'a>(mut self, settings: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let parts: BTreeMap<&str, &str> = settings.into_iter().collect();
        self.fingerprint = fingerprint(&parts);
        self
    }
}

impl std::fmt::Display for ModelCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{:?}", self.provider, self.model, self.ttl)
    }
}

fn fingerprint(parts: &BTreeMap<&str, &str>) -> String {
    let canonical = serde_json::to_string(parts).unwrap_or_default();
    hex_digest(canonical.as_bytes())
}

pub(crate) fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_order_is_irrelevant() {
        let a = ModelCacheKey::new("mistral", "open-mistral-7b", Duration::from_secs(60))
            .with_settings([("key", "k1"), ("endpoint", "https://x")]);
        let b = ModelCacheKey::new("mistral", "open-mistral-7b", Duration::from_secs(60))
            .with_settings([("endpoint", "https://x"), ("key", "k1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_configurations_do_not_collide() {
        let base = ModelCacheKey::new("mistral", "open-mistral-7b", Duration::from_secs(60));
        let k1 = base.clone().with_settings([("key", "k1")]);
        let k2 = base.clone().with_settings([("key", "k2")]);
        assert_ne!(k1, k2);

        let other_ttl = ModelCacheKey::new("mistral", "open-mistral-7b", Duration::from_secs(61))
            .with_settings([("key", "k1")]);
        assert_ne!(k1, other_ttl);

        // Fields are not concatenated, so shifting characters between them changes the key.
        let shifted = ModelCacheKey::new("mistra", "lopen-mistral-7b", Duration::from_secs(60))
            .with_settings([("key", "k1")]);
        assert_ne!(k1, shifted);
    }

    #[test]
    fn test_fingerprint_hides_credentials() {
        let key = ModelCacheKey::new("mistral", "m", Duration::from_secs(1))
            .with_settings([("key", "super-secret")]);
        assert!(!key.fingerprint.contains("super-secret"));
        assert_eq!(key.fingerprint.len(), 64);
        assert_eq!(key.to_string(), "mistral/m@1s");
    }
}
