//! Persisted credential pair.
//!
//! The pair is stored under the fixed keys `access_token` and `refresh_token`.
//! Every write replaces the whole record, so readers never observe a state
//! between removing the old access token and writing the new one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> ClientResult<Credentials>;

    fn save(&self, credentials: &Credentials) -> ClientResult<()>;

    fn clear(&self) -> ClientResult<()>;

    /// Replaces the access token and keeps the stored refresh token.
    fn set_access_token(&self, token: &str) -> ClientResult<()> {
        let mut credentials = self.load()?;
        credentials.access_token = Some(token.to_string());
        self.save(&credentials)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: Mutex::new(credentials),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> ClientResult<Credentials> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| ClientError::Credentials("credential lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn save(&self, credentials: &Credentials) -> ClientResult<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ClientError::Credentials("credential lock poisoned".to_string()))?;
        *guard = credentials.clone();
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        self.save(&Credentials::default())
    }
}

/// JSON file store. Writes go to a sibling temp file that is renamed over
/// the target; on unix the file is created with mode `0600`.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> ClientResult<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| ClientError::Credentials("credential lock poisoned".to_string()))
    }

    fn read(&self) -> ClientResult<Credentials> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Credentials::default()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(credentials) => Ok(credentials),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "ignoring unreadable credentials file"
                    );
                    Ok(Credentials::default())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Credentials::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, credentials: &Credentials) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp_path)?;
        file.write_all(serde_json::to_string_pretty(credentials)?.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> ClientResult<Credentials> {
        let _guard = self.guard()?;
        self.read()
    }

    fn save(&self, credentials: &Credentials) -> ClientResult<()> {
        let _guard = self.guard()?;
        self.write(credentials)
    }

    fn clear(&self) -> ClientResult<()> {
        let _guard = self.guard()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn set_access_token(&self, token: &str) -> ClientResult<()> {
        let _guard = self.guard()?;
        let mut credentials = self.read()?;
        credentials.access_token = Some(token.to_string());
        self.write(&credentials)
    }
}
