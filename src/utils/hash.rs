use sha2::{Digest, Sha256};

/// Widget API keys are stored hashed; the plaintext key is only ever returned
/// once, at site registration.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Visitor IPs are never stored in the clear. The secret keeps the hash from
/// being reversible by rainbow table.
pub fn hash_ip_address(ip_address: &str) -> String {
    let secret = std::env::var("IP_HASH_SECRET").unwrap_or_else(|_| "default-secret".to_string());
    let mut hasher = Sha256::new();
    hasher.update(ip_address.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_hash_is_stable() {
        assert_eq!(hash_api_key("sa-test"), hash_api_key("sa-test"));
        assert_ne!(hash_api_key("sa-test"), hash_api_key("sa-other"));
    }

    #[test]
    fn ip_hash_does_not_leak_input() {
        let hash = hash_ip_address("203.0.113.7");
        assert!(!hash.contains("203.0.113.7"));
        assert_eq!(hash.len(), 64);
    }
}
