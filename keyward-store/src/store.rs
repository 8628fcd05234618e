//! The metadata store.
//!
//! [`SecretStore`] keeps the whole document in memory and rewrites the file
//! after every successful mutation.  Writes go to a sibling temp file that is
//! then renamed over the original, so a concurrent reader sees either the old
//! or the new document, never a torn one.  If the write fails the in-memory
//! mutation is rolled back so memory and disk stay identical.
//!
//! Group references are resolved by an iterative walk with a visited set and
//! a depth cap; a cyclic or absurdly deep chain in a hand-edited file is
//! reported as [`StoreError::Corrupt`] instead of looping.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use keyward_core::Secret;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{SecretRecord, StoreData};

/// Longest group chain accepted when resolving a secret.
pub const MAX_GROUP_DEPTH: usize = 64;

#[derive(Debug)]
pub struct SecretStore {
    path: PathBuf,
    data: StoreData,
}

impl SecretStore {
    /// Open the store at `path`.
    ///
    /// A missing file is an empty store, not an error; nothing is written
    /// until the first mutation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = read_data(&path)?;
        info!(
            path = %path.display(),
            count = data.secrets.len(),
            "secret store opened"
        );
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing the in-memory view.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.data = read_data(&self.path)?;
        debug!(count = self.data.secrets.len(), "secret store reloaded");
        Ok(())
    }

    /// Resolve `name` including its full group chain.
    pub fn get(&self, name: &str) -> Result<Secret, StoreError> {
        self.resolve(name)
    }

    /// Resolve every stored secret, ordered by name.
    pub fn list(&self) -> Result<Vec<Secret>, StoreError> {
        self.data
            .secrets
            .keys()
            .map(|name| self.resolve(name))
            .collect()
    }

    pub fn list_by_type(&self, secret_type: &str) -> Result<Vec<Secret>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.secret_type == secret_type)
            .collect())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.data.secrets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.data.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.secrets.is_empty()
    }

    /// Insert a new secret and persist.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the name is taken and with
    /// [`StoreError::NotFound`] if the secret names a group that is not
    /// stored.  In both cases the store is unchanged.
    pub fn store(&mut self, secret: &Secret) -> Result<(), StoreError> {
        if self.exists(&secret.name) {
            return Err(StoreError::AlreadyExists(secret.name.clone()));
        }
        if let Some(group) = secret.group_name()
            && !self.exists(group)
        {
            return Err(StoreError::NotFound(group.to_string()));
        }

        self.data
            .secrets
            .insert(secret.name.clone(), SecretRecord::encode(secret));

        if let Err(e) = self.persist() {
            self.data.secrets.remove(&secret.name);
            return Err(e);
        }

        debug!(
            name = %secret.name,
            group = secret.group_name().unwrap_or(""),
            "secret stored"
        );
        Ok(())
    }

    /// Remove `name` and, transitively, every secret grouped under it.
    ///
    /// Returns the removed names (empty when `name` was not stored).
    pub fn remove(&mut self, name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.remove_records(name)?.into_keys().collect())
    }

    /// Like [`remove`](Self::remove), but hands back the removed records.
    ///
    /// Nothing is resolved, so records with a dangling or cyclic group
    /// chain can still be removed.
    pub fn remove_records(
        &mut self,
        name: &str,
    ) -> Result<BTreeMap<String, SecretRecord>, StoreError> {
        if !self.exists(name) {
            return Ok(BTreeMap::new());
        }

        let doomed = self.with_descendants(name);
        let removed: BTreeMap<String, SecretRecord> = doomed
            .iter()
            .filter_map(|n| self.data.secrets.remove_entry(n))
            .collect();

        if let Err(e) = self.persist() {
            self.data.secrets.extend(removed);
            return Err(e);
        }

        debug!(name, removed = removed.len(), "secret removed");
        Ok(removed)
    }

    /// `name` plus every record whose group chain reaches it.
    fn with_descendants(&self, name: &str) -> Vec<String> {
        let mut found = vec![name.to_string()];
        let mut seen: HashSet<String> = HashSet::from([name.to_string()]);
        let mut queue = VecDeque::from([name.to_string()]);

        while let Some(parent) = queue.pop_front() {
            for (child, record) in &self.data.secrets {
                if record.group == parent && seen.insert(child.clone()) {
                    found.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        found
    }

    fn resolve<'a>(&'a self, name: &'a str) -> Result<Secret, StoreError> {
        let mut chain: Vec<(&str, &SecretRecord)> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut next = Some(name);

        while let Some(current) = next {
            if !seen.insert(current) {
                return Err(StoreError::Corrupt(format!(
                    "group cycle detected while resolving {name} (revisited {current})"
                )));
            }
            if chain.len() >= MAX_GROUP_DEPTH {
                return Err(StoreError::Corrupt(format!(
                    "group chain of {name} exceeds {MAX_GROUP_DEPTH} levels"
                )));
            }
            let record = self
                .data
                .secrets
                .get(current)
                .ok_or_else(|| StoreError::NotFound(current.to_string()))?;
            chain.push((current, record));
            next = record.group_name();
        }

        // Build from the root down so each level owns its parent.
        let mut resolved: Option<Box<Secret>> = None;
        for (current, record) in chain.into_iter().rev() {
            let public_data = record.public_data_bytes().map_err(|e| {
                StoreError::Corrupt(format!("public data of {current} is not base64: {e}"))
            })?;
            resolved = Some(Box::new(Secret {
                name: current.to_string(),
                file_id: record.file_id.clone(),
                cap_id: record.cap_id.clone(),
                secret_type: record.secret_type.clone(),
                public_data,
                group: resolved,
            }));
        }

        resolved
            .map(|s| *s)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn persist(&self) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&self.data)
            .map_err(|e| StoreError::Corrupt(format!("failed to serialise store: {e}")))?;
        write_store_file(&self.path, &body)?;
        Ok(())
    }
}

fn read_data(path: &Path) -> Result<StoreData, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "secret store file absent, starting empty");
            return Ok(StoreData::default());
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
}

/// Write `data` to `path` with Unix mode `0600`, replacing any existing file.
///
/// Uses a write-then-rename strategy so the file is never partially written.
fn write_store_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        #[cfg(unix)]
        let mut f = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?
        };
        #[cfg(not(unix))]
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        f.write_all(data)?;
        f.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)
}
