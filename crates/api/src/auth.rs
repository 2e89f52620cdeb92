//! Bearer-token authentication. The token/customer mapping is a
//! collaborator this system consumes, not implements — [`DummyTokenVerifier`]
//! is a fixed in-memory stand-in (mirroring a local development token
//! database) so the HTTP surface can be exercised end to end; a real
//! deployment swaps in a verifier backed by whatever identity system
//! issues the bearer tokens.

use std::collections::HashMap;

use domain::CustomerId;

/// Resolves a bearer token to the `CustomerId` that owns it.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<CustomerId>;
}

/// A fixed token table for local development and tests.
pub struct DummyTokenVerifier {
    tokens: HashMap<String, CustomerId>,
}

impl DummyTokenVerifier {
    pub fn new() -> Self {
        let mut tokens = HashMap::new();
        tokens.insert("token-alice".to_string(), CustomerId::new("alice"));
        tokens.insert("token-bob".to_string(), CustomerId::new("bob"));
        Self { tokens }
    }
}

impl Default for DummyTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVerifier for DummyTokenVerifier {
    fn verify(&self, token: &str) -> Option<CustomerId> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_token_resolves_to_its_customer() {
        let verifier = DummyTokenVerifier::new();
        assert_eq!(
            verifier.verify("token-alice"),
            Some(CustomerId::new("alice"))
        );
    }

    #[test]
    fn unknown_token_resolves_to_nothing() {
        let verifier = DummyTokenVerifier::new();
        assert!(verifier.verify("token-nobody").is_none());
    }
}
