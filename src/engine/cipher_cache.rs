use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::CipherProvider;
use crate::Result;

/// Passphrase-keyed cache of [`CipherProvider`]s.
///
/// Deriving a key hashes the passphrase, and per-value encryption repeats the same
/// passphrases on every read and write, so providers are built once and shared.
/// A cache is constructed explicitly and can be shared between databases through
/// [`Database::create_or_load_with`](crate::engine::Database::create_or_load_with).
/// Dropping or clearing it releases every provider it handed out.
#[derive(Default)]
pub struct CipherCache {
    providers: DashMap<String, Arc<CipherProvider>>,
}

impl CipherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the provider for `passphrase`, deriving it on first use.
    pub fn get_or_create(&self, passphrase: &str) -> Result<Arc<CipherProvider>> {
        if let Some(provider) = self.providers.get(passphrase) {
            return Ok(provider.value().clone());
        }
        let provider = Arc::new(CipherProvider::new(passphrase)?);
        // A racing caller may have inserted first; keep whichever landed.
        Ok(self
            .providers
            .entry(passphrase.to_string())
            .or_insert(provider)
            .value()
            .clone())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Releases and forgets every cached provider.
    pub fn clear(&self) {
        let keys: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, provider)) = self.providers.remove(&key) {
                provider.release();
            }
        }
    }
}

impl Drop for CipherCache {
    fn drop(&mut self) {
        if !self.providers.is_empty() {
            log::debug!("Releasing {} cached cipher providers", self.providers.len());
        }
        self.clear();
    }
}

impl std::fmt::Debug for CipherCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherCache")
            .field("providers", &self.providers.len())
            .finish()
    }
}
