//! Deferred secrets.
//!
//! Configuration only ever holds a [`SecretRef`] (`os.<name>`). The engine
//! asks a [`SecretResolver`] for the value right before each external call
//! and drops it afterwards; nothing resolved is stored in the registry or the
//! binding graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

mod dotenv;
mod store;

pub use dotenv::DotEnvResolver;
pub use store::SecretStore;

/// Symbolic `os.<name>` pointer to a secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    name: String,
}

impl SecretRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Environment-style spelling: `openrouter_api_key` → `OPENROUTER_API_KEY`.
    pub fn env_name(&self) -> String {
        self.name.to_uppercase()
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os.{}", self.name)
    }
}

/// A resolved secret. Debug and Display never show the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl From<SecretValue> for glue_llm::ApiKey {
    fn from(value: SecretValue) -> Self {
        glue_llm::ApiKey::new(value.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret `{0}` not found")]
    NotFound(SecretRef),

    #[error("secret backend failed for `{reference}`: {message}")]
    Backend { reference: SecretRef, message: String },
}

/// Resolves secret references at call time.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, reference: &SecretRef) -> Result<SecretValue, SecretError>;
}

/// Process environment: the exact name first, then its upper-case form.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvResolver;

#[async_trait]
impl SecretResolver for EnvResolver {
    async fn resolve(&self, reference: &SecretRef) -> Result<SecretValue, SecretError> {
        [reference.name().to_string(), reference.env_name()]
            .into_iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .map(SecretValue::new)
            .ok_or_else(|| SecretError::NotFound(reference.clone()))
    }
}

/// Fixed in-memory secrets, for embedding and tests.
#[derive(Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("StaticSecrets").field("names", &names).finish()
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve(&self, reference: &SecretRef) -> Result<SecretValue, SecretError> {
        self.values
            .get(reference.name())
            .or_else(|| self.values.get(&reference.env_name()))
            .map(SecretValue::new)
            .ok_or_else(|| SecretError::NotFound(reference.clone()))
    }
}

/// Tries each resolver in order. A miss moves on to the next resolver;
/// backend failures are reported only if nothing else resolves the name.
#[derive(Default, Clone)]
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn SecretResolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Environment, then the nearest `.env`, then `~/.glue/secrets.json`.
    pub fn standard() -> Self {
        let mut chain = Self::new().with(Arc::new(EnvResolver));
        if let Ok(cwd) = std::env::current_dir() {
            if let Some(dotenv) = DotEnvResolver::discover(&cwd) {
                chain = chain.with(Arc::new(dotenv));
            }
        }
        match SecretStore::default_path() {
            Ok(path) => chain.with(Arc::new(SecretStore::at(path))),
            Err(e) => {
                debug!("Secret store unavailable: {e}");
                chain
            }
        }
    }
}

#[async_trait]
impl SecretResolver for ChainResolver {
    async fn resolve(&self, reference: &SecretRef) -> Result<SecretValue, SecretError> {
        let mut backend_error = None;
        for resolver in &self.resolvers {
            match resolver.resolve(reference).await {
                Ok(value) => return Ok(value),
                Err(SecretError::NotFound(_)) => continue,
                Err(e) => {
                    debug!("Secret resolver failed for {reference}: {e}");
                    backend_error.get_or_insert(e);
                }
            }
        }
        Err(backend_error.unwrap_or_else(|| SecretError::NotFound(reference.clone())))
    }
}
