//! Durable backends for the persisted session record.
//!
//! The record is the JSON-serialized [`Session`]. Backends are synchronous;
//! a read failure or unparsable record is reported as an error and the store
//! decides what to do with it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};

use super::session::Session;
use crate::config::Config;

/// Session file name in the session directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name for the keyring backend
const KEYRING_SERVICE: &str = "storefront";

/// Keychain account holding the session record
const KEYRING_ACCOUNT: &str = "session";

pub trait SessionStorage: Send + Sync {
    /// Read the persisted record, `Ok(None)` if there is none.
    fn load(&self) -> Result<Option<Session>>;

    fn save(&self, session: &Session) -> Result<()>;

    /// Erase the record. Removing a missing record succeeds.
    fn remove(&self) -> Result<()>;
}

/// Which backend holds the session between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

/// Open the backend selected by the configuration.
pub fn open(config: &Config) -> Result<Arc<dyn SessionStorage>> {
    Ok(match config.storage {
        StorageKind::File => Arc::new(FileSessionStorage::new(config.session_dir()?)),
        StorageKind::Keyring => Arc::new(KeyringSessionStorage::new(KEYRING_SERVICE, KEYRING_ACCOUNT)),
        StorageKind::Memory => Arc::new(MemorySessionStorage::new()),
    })
}

fn parse_record(contents: &str) -> Result<Session> {
    serde_json::from_str(contents).context("Failed to parse session record")
}

/// Session record stored as `session.json` in a directory.
pub struct FileSessionStorage {
    dir: PathBuf,
}

impl FileSessionStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }
}

impl SessionStorage for FileSessionStorage {
    fn load(&self) -> Result<Option<Session>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        parse_record(&contents).map(Some)
    }

    fn save(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create session directory {}", self.dir.display()))?;
        let contents = serde_json::to_string_pretty(session)?;
        write_atomic(&self.path(), &contents)
    }

    fn remove(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(&path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// Write via a temp file and rename so a crash never leaves a half-written record.
/// The record holds credentials, so on Unix it is readable by the owner only.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_name = format!(
        "{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
    );
    let tmp_path = path.with_file_name(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp_path).context("Failed to create session file")?;
    // mode() only applies on creation; a leftover temp file keeps its old bits.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict session file permissions")?;
    }
    file.write_all(contents.as_bytes()).context("Failed to write session file")?;
    file.sync_all().context("Failed to flush session file")?;
    drop(file);

    std::fs::rename(&tmp_path, path).context("Failed to replace session file")?;
    Ok(())
}

/// Session record kept as a secret in the OS keychain.
pub struct KeyringSessionStorage {
    service: String,
    account: String,
}

impl KeyringSessionStorage {
    pub fn new(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, &self.account).context("Failed to create keyring entry")
    }
}

impl SessionStorage for KeyringSessionStorage {
    fn load(&self) -> Result<Option<Session>> {
        match self.entry()?.get_password() {
            Ok(contents) => parse_record(&contents).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read session from keychain"),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        let contents = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&contents)
            .context("Failed to store session in keychain")
    }

    fn remove(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

/// Process-local backend. Holds the raw record so it behaves like the
/// durable backends, including on unparsable contents.
#[derive(Default)]
pub struct MemorySessionStorage {
    record: Mutex<Option<String>>,
    saves: Mutex<usize>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with an arbitrary record.
    pub fn with_raw(contents: &str) -> Self {
        Self {
            record: Mutex::new(Some(contents.to_string())),
            saves: Mutex::new(0),
        }
    }

    pub fn has_record(&self) -> bool {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStorage for MemorySessionStorage {
    fn load(&self) -> Result<Option<Session>> {
        let record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        record.as_deref().map(parse_record).transpose()
    }

    fn save(&self, session: &Session) -> Result<()> {
        let contents = serde_json::to_string(session)?;
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents);
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
