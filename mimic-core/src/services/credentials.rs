//! services/credentials.rs
//! Credential ledger: client identity -> TOTP secret.
//!
//! - One record per line, `identity::secret`, append-only.
//! - `lookup` returns the FIRST record for an identity (earliest enrollment wins).
//! - `load_all` folds the whole ledger, so later records overwrite earlier ones.
//!   It only answers "is this identity known"; code verification goes through
//!   `lookup`. The two policies disagree when an identity was enrolled twice.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SEPARATOR: &str = "::";

pub trait CredentialStore {
    /// Durably append one record.
    fn append(&self, identity: &str, secret: &str) -> io::Result<()>;
    /// First matching record, if any.
    fn lookup(&self, identity: &str) -> io::Result<Option<String>>;
    /// Every identity with its last recorded secret.
    fn load_all(&self) -> io::Result<HashMap<String, String>>;

    fn is_known(&self, identity: &str) -> io::Result<bool> {
        Ok(self.load_all()?.contains_key(identity))
    }
}

/// Split on the last separator: secrets are base32 and never contain `:`,
/// identities (IPv6) might.
pub fn parse_record(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let (identity, secret) = line.rsplit_once(SEPARATOR)?;
    if identity.is_empty() || secret.is_empty() {
        return None;
    }
    Some((identity, secret))
}

pub fn format_record(identity: &str, secret: &str) -> String {
    format!("{identity}{SEPARATOR}{secret}\n")
}

/// File-backed ledger. The file is created empty on first access.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::OpenOptions::new().create(true).append(true).open(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> io::Result<Vec<(String, String)>> {
        let f = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line?;
            if let Some((id, secret)) = parse_record(&line) {
                out.push((id.to_string(), secret.to_string()));
            }
        }
        Ok(out)
    }
}

impl CredentialStore for FileCredentialStore {
    fn append(&self, identity: &str, secret: &str) -> io::Result<()> {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(format_record(identity, secret).as_bytes())?;
        f.flush()?;
        f.sync_data()
    }

    fn lookup(&self, identity: &str) -> io::Result<Option<String>> {
        Ok(self
            .records()?
            .into_iter()
            .find(|(id, _)| id == identity)
            .map(|(_, secret)| secret))
    }

    fn load_all(&self) -> io::Result<HashMap<String, String>> {
        Ok(self.records()?.into_iter().collect())
    }
}

/// In-process ledger with the same resolution rules as the file store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: Mutex<Vec<(String, String)>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> io::Result<Vec<(String, String)>> {
        self.records
            .lock()
            .map(|r| r.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "credential store poisoned"))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn append(&self, identity: &str, secret: &str) -> io::Result<()> {
        self.records
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "credential store poisoned"))?
            .push((identity.to_string(), secret.to_string()));
        Ok(())
    }

    fn lookup(&self, identity: &str) -> io::Result<Option<String>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .find(|(id, _)| id == identity)
            .map(|(_, s)| s))
    }

    fn load_all(&self) -> io::Result<HashMap<String, String>> {
        Ok(self.snapshot()?.into_iter().collect())
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for &T {
    fn append(&self, identity: &str, secret: &str) -> io::Result<()> {
        (**self).append(identity, secret)
    }

    fn lookup(&self, identity: &str) -> io::Result<Option<String>> {
        (**self).lookup(identity)
    }

    fn load_all(&self) -> io::Result<HashMap<String, String>> {
        (**self).load_all()
    }
}
