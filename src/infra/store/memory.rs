//! In-memory token and temp-token stores.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::{ProviderError, TempToken, Token, TokenStore};
use crate::util::clock::now_ms;

/// Token store backed by a map; for development, embedding and tests.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, Token>>,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn find_by_access_token(&self, access_token: &str) -> Result<Option<Token>, ProviderError> {
        Ok(self.tokens.read().get(access_token).cloned())
    }

    async fn save(&self, token: &Token) -> Result<(), ProviderError> {
        self.tokens
            .write()
            .insert(token.access_token.clone(), token.clone());
        Ok(())
    }

    async fn remove(&self, access_token: &str) -> Result<(), ProviderError> {
        self.tokens.write().remove(access_token);
        Ok(())
    }
}

/// Holds OAuth handshake state until the callback consumes it.
pub struct InMemoryTempTokenStore {
    ttl: Duration,
    pending: RwLock<HashMap<String, TempToken>>,
}

impl InMemoryTempTokenStore {
    /// Create a store whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Record a handshake keyed by its authorization code.
    pub fn insert(&self, temp: TempToken) {
        let now = now_ms();
        let mut pending = self.pending.write();
        pending.retain(|_, t| !t.is_expired(now, self.ttl));
        pending.insert(temp.code.clone(), temp);
    }

    /// Consume a handshake. Expired or already used codes yield `None`.
    pub fn take(&self, code: &str) -> Option<TempToken> {
        let temp = self.pending.write().remove(code)?;
        (!temp.is_expired(now_ms(), self.ttl)).then_some(temp)
    }
}
