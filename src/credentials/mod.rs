use async_trait::async_trait;
use std::collections::HashMap;

use crate::providers::{Credential, ProviderKind};

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Resolves the decrypted secret for a job at dispatch time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` means the owner has no usable key for `provider`
    async fn get_credential(
        &self,
        credential_ref: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credential>, CredentialStoreError>;
}

/// Reads one key per provider from the process environment
/// (`GEMINI_API_KEY`, `OPENAI_API_KEY`), ignoring the credential reference
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get_credential(
        &self,
        _credential_ref: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credential>, CredentialStoreError> {
        Ok(std::env::var(provider.api_key_env())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(Credential::new))
    }
}

/// Fixed credentials keyed by (reference, provider)
#[derive(Default)]
pub struct StaticCredentialStore {
    secrets: HashMap<(String, ProviderKind), Credential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential_ref: &str, provider: ProviderKind, secret: &str) -> Self {
        self.secrets
            .insert((credential_ref.to_string(), provider), Credential::new(secret));
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get_credential(
        &self,
        credential_ref: &str,
        provider: ProviderKind,
    ) -> Result<Option<Credential>, CredentialStoreError> {
        Ok(self
            .secrets
            .get(&(credential_ref.to_string(), provider))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_store_is_keyed_by_provider() {
        let store = StaticCredentialStore::new().with("user-1", ProviderKind::Gemini, "g-secret");

        let found = store.get_credential("user-1", ProviderKind::Gemini).await.unwrap();
        assert_eq!(found.map(|c| c.expose().to_string()), Some("g-secret".to_string()));

        assert!(store.get_credential("user-1", ProviderKind::Whisper).await.unwrap().is_none());
        assert!(store.get_credential("user-2", ProviderKind::Gemini).await.unwrap().is_none());
    }
}
