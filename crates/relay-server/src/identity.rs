//! Minting and validation of visitor session tokens.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use relay_core::{RelayError, SessionToken};
use relay_store::MessageStore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};

/// Derive a token from a random draw and the server salt.
pub fn hash_token(value: u64, salt: &SecretString) -> SessionToken {
    let mut hasher = Sha512::new();
    hasher.update(value.to_string().as_bytes());
    hasher.update(salt.expose_secret().as_bytes());
    SessionToken::from_raw(STANDARD.encode(hasher.finalize()))
}

pub struct SessionIdentity {
    store: Arc<dyn MessageStore>,
    salt: SecretString,
    max_attempts: u32,
}

impl SessionIdentity {
    pub fn new(store: Arc<dyn MessageStore>, salt: SecretString, max_attempts: u32) -> Self {
        Self {
            store,
            salt,
            max_attempts,
        }
    }

    /// Mint a fresh token and persist an empty session for it.
    pub fn mint(&self) -> Result<SessionToken, RelayError> {
        self.mint_with(&mut rand::thread_rng())
    }

    pub fn mint_with<R: RngCore>(&self, rng: &mut R) -> Result<SessionToken, RelayError> {
        for attempt in 1..=self.max_attempts {
            let token = hash_token(rng.next_u64(), &self.salt);
            if self.store.session_exists(&token)? {
                tracing::debug!(attempt, "token collision, drawing again");
                continue;
            }
            self.store.create_session(&token)?;
            tracing::info!(token = %token.short(), attempt, "token minted");
            return Ok(token);
        }
        tracing::warn!(attempts = self.max_attempts, "token space exhausted");
        Err(RelayError::TokenSpaceExhausted {
            attempts: self.max_attempts,
        })
    }

    /// True iff a persisted session exists. Malformed tokens never reach the store.
    pub fn validate(&self, token: &SessionToken) -> Result<bool, RelayError> {
        if !token.is_well_formed() {
            return Ok(false);
        }
        Ok(self.store.session_exists(token)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use relay_store::{Database, SqliteMessageStore};

    fn identity(attempts: u32) -> (SessionIdentity, Arc<dyn MessageStore>) {
        let store: Arc<dyn MessageStore> =
            Arc::new(SqliteMessageStore::new(Database::in_memory().unwrap()));
        let salt = SecretString::from("pepper".to_string());
        (SessionIdentity::new(store.clone(), salt, attempts), store)
    }

    #[test]
    fn hash_is_deterministic_and_salted() {
        let a = SecretString::from("a".to_string());
        let b = SecretString::from("b".to_string());
        assert_eq!(hash_token(42, &a), hash_token(42, &a));
        assert_ne!(hash_token(42, &a), hash_token(42, &b));
        assert_ne!(hash_token(42, &a), hash_token(43, &a));
        assert!(hash_token(42, &a).is_well_formed());
        assert_eq!(hash_token(42, &a).as_str().len(), SessionToken::ENCODED_LEN);
    }

    #[test]
    fn minted_tokens_are_distinct_and_valid() {
        let (identity, store) = identity(16);
        let t1 = identity.mint().unwrap();
        let t2 = identity.mint().unwrap();
        assert_ne!(t1, t2);
        assert!(identity.validate(&t1).unwrap());
        assert!(identity.validate(&t2).unwrap());
        assert!(store.messages_for(&t1).unwrap().is_empty());
    }

    #[test]
    fn collision_retries_with_fresh_draw() {
        let (identity, _store) = identity(4);
        // Both generators start at 0, so the second mint collides once.
        let first = identity.mint_with(&mut StepRng::new(0, 1)).unwrap();
        let second = identity.mint_with(&mut StepRng::new(0, 1)).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, hash_token(1, &SecretString::from("pepper".to_string())));
    }

    #[test]
    fn exhaustion_is_bounded() {
        let (identity, _store) = identity(3);
        identity.mint_with(&mut StepRng::new(7, 0)).unwrap();
        let err = identity.mint_with(&mut StepRng::new(7, 0)).unwrap_err();
        assert_eq!(err, RelayError::TokenSpaceExhausted { attempts: 3 });
    }

    #[test]
    fn unknown_or_malformed_tokens_are_invalid() {
        let (identity, store) = identity(16);
        let forged = hash_token(99, &SecretString::from("other".to_string()));
        assert!(!identity.validate(&forged).unwrap());
        assert!(!identity.validate(&SessionToken::from_raw("short")).unwrap());
        assert!(!store.session_exists(&forged).unwrap());
    }
}
