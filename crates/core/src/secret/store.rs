use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::warn;

use super::{SecretError, SecretRef, SecretResolver, SecretValue};

/// Secrets kept in a JSON object on disk, `~/.glue/secrets.json` by default.
///
/// Editing (`set`/`delete`) works on an in-memory copy that is written back
/// immediately. Resolution re-reads the file on every call.
#[derive(Debug)]
pub struct SecretStore {
    /// Map of secret keys to their values
    secrets: HashMap<String, String>,
    /// Path to the secrets file
    file_path: PathBuf,
}

impl SecretStore {
    /// Location of the per-user store.
    pub fn default_path() -> io::Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
        Ok(home_dir.join(".glue").join("secrets.json"))
    }

    /// Opens the per-user store, loading any existing secrets.
    pub fn new() -> io::Result<Self> {
        Self::open(Self::default_path()?)
    }

    /// Opens a store at `file_path`, loading any existing secrets.
    pub fn open(file_path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut store = Self::at(file_path);
        store.load()?;
        Ok(store)
    }

    /// A store at `file_path` without reading it yet.
    pub fn at(file_path: impl Into<PathBuf>) -> Self {
        Self {
            secrets: HashMap::new(),
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn read_file(path: &Path) -> io::Result<HashMap<String, String>> {
        match File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                serde_json::from_str(&contents)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    fn load(&mut self) -> io::Result<()> {
        self.secrets = Self::read_file(&self.file_path)?;
        Ok(())
    }

    fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&self.secrets)?;
        let mut file = File::create(&self.file_path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Sets a secret value for the given key and persists the store.
    pub fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.secrets.insert(key.to_string(), value.to_string());
        self.save()
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.secrets.get(key)
    }

    /// Deletes a secret and persists the store. Missing keys are not an error.
    pub fn delete(&mut self, key: &str) -> io::Result<()> {
        self.secrets.remove(key);
        self.save()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl SecretResolver for SecretStore {
    async fn resolve(&self, reference: &SecretRef) -> Result<SecretValue, SecretError> {
        let path = self.file_path.clone();
        let secrets = tokio::task::spawn_blocking(move || Self::read_file(&path))
            .await
            .map_err(|e| SecretError::Backend {
                reference: reference.clone(),
                message: e.to_string(),
            })?
            .map_err(|e| {
                warn!("Could not read secret store {}: {e}", self.file_path.display());
                SecretError::Backend {
                    reference: reference.clone(),
                    message: e.to_string(),
                }
            })?;
        secrets
            .get(reference.name())
            .or_else(|| secrets.get(&reference.env_name()))
            .map(SecretValue::new)
            .ok_or_else(|| SecretError::NotFound(reference.clone()))
    }
}
