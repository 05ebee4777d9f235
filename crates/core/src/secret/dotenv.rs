use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{SecretError, SecretRef, SecretResolver, SecretValue};

const DOTENV_FILE: &str = ".env";

/// Reads secrets from a `.env` file.
///
/// The file is re-read on every lookup so edits take effect for the next
/// call and no values stay in memory between calls.
#[derive(Debug, Clone)]
pub struct DotEnvResolver {
    path: PathBuf,
}

impl DotEnvResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Walk up from `start` to the first directory containing `.env`.
    pub fn discover(start: &Path) -> Option<Self> {
        start
            .ancestors()
            .map(|dir| dir.join(DOTENV_FILE))
            .find(|candidate| candidate.is_file())
            .map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `KEY=value` lines; `#` comments, blank lines and an `export ` prefix are
/// allowed, values may be single- or double-quoted.
pub(crate) fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[async_trait]
impl SecretResolver for DotEnvResolver {
    async fn resolve(&self, reference: &SecretRef) -> Result<SecretValue, SecretError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(reference.clone()))
            }
            Err(e) => {
                return Err(SecretError::Backend {
                    reference: reference.clone(),
                    message: format!("{}: {e}", self.path.display()),
                })
            }
        };
        let values = parse_dotenv(&contents);
        values
            .get(reference.name())
            .or_else(|| values.get(&reference.env_name()))
            .filter(|v| !v.is_empty())
            .map(SecretValue::new)
            .ok_or_else(|| SecretError::NotFound(reference.clone()))
    }
}
