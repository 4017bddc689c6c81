//! Proxy manifest store: the durable record of what is deployed where.
//!
//! One JSON file per network lives in the manifest directory:
//!
//! ```text
//! <manifest_dir>/<network>.json        records + superseded history
//! <manifest_dir>/<network>.lock        guards writes to the file above
//! <manifest_dir>/<network>.<name>.lease held for the duration of a reconciliation
//! ```
//!
//! Writes go to a temporary file that is renamed over the original, so a reader
//! sees either the previous or the next version of a record, never a mix.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use alloy_core::primitives::{Address, B256};
use derive_more::Display;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

/// Current on-disk format of a network file.
pub const MANIFEST_FORMAT: u32 = 1;

/// How a record's contract was deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeploymentKind {
    /// ERC-1967 proxy in front of a swappable implementation.
    #[default]
    Proxy,
    /// Non-upgradeable contract created with constructor arguments.
    Direct,
}

/// The transition that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RecordOrigin {
    Deployed,
    Upgraded,
    Imported,
}

/// Deployment state of one logical contract on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub network: String,
    pub logical_name: String,
    /// Stable public address. Never changes once set.
    pub proxy_address: Address,
    pub implementation_address: Address,
    pub abi_version: u64,
    /// Most recent state-changing transaction. Imported records have none.
    pub last_transaction_hash: Option<B256>,
    #[serde(default)]
    pub kind: DeploymentKind,
    pub origin: RecordOrigin,
    /// Unix timestamp of the transition that wrote this record.
    pub updated_at: u64,
}

impl ProxyRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.network, &self.logical_name)
    }
}

/// `(network, logical name)` pair identifying at most one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{network}/{logical_name}")]
pub struct RecordKey {
    pub network: String,
    pub logical_name: String,
}

impl RecordKey {
    pub fn new(network: impl Into<String>, logical_name: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            logical_name: logical_name.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ManifestError {
    /// The file exists but cannot be parsed. Mutations must stop.
    #[error("manifest {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },
    #[error("manifest io error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("record {record} belongs to network {found}, not {expected}")]
    NetworkMismatch {
        record: String,
        expected: String,
        found: String,
    },
    #[error("refusing to change proxy address of {key} from {current} to {new}")]
    ProxyAddressChanged {
        key: RecordKey,
        current: Address,
        new: Address,
    },
    #[error("invalid name `{0}` for a manifest key")]
    InvalidName(String),
    #[error("a reconciliation for {key} is already in progress")]
    InProgress { key: RecordKey },
}

impl ManifestError {
    fn io(path: &Path, e: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

/// On-disk content of one network file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkManifest {
    pub format: u32,
    pub network: String,
    /// Live records keyed by logical name.
    pub contracts: BTreeMap<String, ProxyRecord>,
    /// Every record that was replaced, oldest first.
    #[serde(default)]
    pub superseded: Vec<ProxyRecord>,
}

/// Whether acquiring a busy key waits or fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LockMode {
    #[default]
    Wait,
    FailFast,
}

/// Exclusive right to mutate one key. Released on drop.
#[derive(Debug)]
pub struct KeyLease {
    key: RecordKey,
    _local: OwnedMutexGuard<()>,
    _file: File,
}

impl KeyLease {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self._file) {
            tracing::warn!(key = %self.key, err = %e, "Failed to release manifest lease");
        }
    }
}

/// Durable store of [`ProxyRecord`]s.
#[derive(Debug)]
pub struct ManifestStore {
    dir: PathBuf,
    leases: Mutex<HashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ManifestStore {
    /// Open (and create if needed) a manifest directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ManifestError::io(&dir, e))?;
        tracing::debug!(path = %dir.display(), "Manifest store opened");
        Ok(Self {
            dir,
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn network_path(&self, network: &str) -> Result<PathBuf, ManifestError> {
        validate_name(network)?;
        Ok(self.dir.join(format!("{network}.json")))
    }

    fn write_lock_path(&self, network: &str) -> PathBuf {
        self.dir.join(format!("{network}.lock"))
    }

    fn lease_path(&self, key: &RecordKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}.lease", key.network, key.logical_name))
    }

    /// Read a whole network file. A missing file is an empty manifest.
    pub fn load_network(&self, network: &str) -> Result<NetworkManifest, ManifestError> {
        let path = self.network_path(network)?;
        if !path.exists() {
            return Ok(NetworkManifest {
                format: MANIFEST_FORMAT,
                network: network.to_string(),
                ..Default::default()
            });
        }

        let content = std::fs::read_to_string(&path).map_err(|e| ManifestError::io(&path, e))?;
        let manifest: NetworkManifest =
            serde_json::from_str(&content).map_err(|e| ManifestError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if manifest.format != MANIFEST_FORMAT {
            return Err(ManifestError::Corrupted {
                path,
                reason: format!("unsupported format {}", manifest.format),
            });
        }
        if manifest.network != network {
            return Err(ManifestError::Corrupted {
                path,
                reason: format!("file declares network {}", manifest.network),
            });
        }
        Ok(manifest)
    }

    /// Current record for `(network, logical_name)`.
    pub fn get(&self, network: &str, logical_name: &str) -> Result<Option<ProxyRecord>, ManifestError> {
        Ok(self.load_network(network)?.contracts.remove(logical_name))
    }

    /// Atomically replace the record for `record.key()`.
    ///
    /// The previous record, if any, is moved to the superseded history.
    pub async fn put(&self, record: ProxyRecord) -> Result<(), ManifestError> {
        validate_name(&record.logical_name)?;
        let path = self.network_path(&record.network)?;
        let lock = self.lock_network_file(&record.network).await?;

        let mut manifest = self.load_network(&record.network)?;
        if let Some(previous) = manifest.contracts.remove(&record.logical_name) {
            if previous.proxy_address != record.proxy_address
                && record.origin != RecordOrigin::Imported
            {
                return Err(ManifestError::ProxyAddressChanged {
                    key: record.key(),
                    current: previous.proxy_address,
                    new: record.proxy_address,
                });
            }
            manifest.superseded.push(previous);
        }

        tracing::debug!(
            key = %record.key(),
            proxy = %record.proxy_address,
            implementation = %record.implementation_address,
            version = record.abi_version,
            "Writing manifest record"
        );
        manifest
            .contracts
            .insert(record.logical_name.clone(), record);

        write_atomically(&path, &manifest)?;
        drop(lock);
        Ok(())
    }

    /// Every live record across all networks, ordered by network then name.
    pub fn all(&self) -> Result<Vec<ProxyRecord>, ManifestError> {
        let mut networks = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ManifestError::io(&self.dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| ManifestError::io(&self.dir, e))?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                networks.push(stem.to_string());
            }
        }
        networks.sort();

        let mut records = Vec::new();
        for network in networks {
            records.extend(self.load_network(&network)?.contracts.into_values());
        }
        Ok(records)
    }

    /// Superseded records for `(network, logical_name)`, oldest first.
    pub fn history(&self, network: &str, logical_name: &str) -> Result<Vec<ProxyRecord>, ManifestError> {
        Ok(self
            .load_network(network)?
            .superseded
            .into_iter()
            .filter(|r| r.logical_name == logical_name)
            .collect())
    }

    /// Acquire the exclusive reconciliation lease for `key`.
    ///
    /// Excludes other tasks of this process and other processes sharing the
    /// manifest directory.
    pub async fn acquire(&self, key: &RecordKey, mode: LockMode) -> Result<KeyLease, ManifestError> {
        validate_name(&key.network)?;
        validate_name(&key.logical_name)?;

        let local = {
            let mut leases = self
                .leases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            leases.entry(key.clone()).or_default().clone()
        };

        let guard = match mode {
            LockMode::Wait => local.lock_owned().await,
            LockMode::FailFast => local
                .try_lock_owned()
                .map_err(|_| ManifestError::InProgress { key: key.clone() })?,
        };

        let path = self.lease_path(key);
        let file = open_lock_file(&path)?;
        match mode {
            LockMode::FailFast => file
                .try_lock_exclusive()
                .map_err(|_| ManifestError::InProgress { key: key.clone() })?,
            LockMode::Wait => wait_for_lock(&file, &path).await?,
        }

        tracing::trace!(key = %key, "Reconciliation lease acquired");
        Ok(KeyLease {
            key: key.clone(),
            _local: guard,
            _file: file,
        })
    }

    async fn lock_network_file(&self, network: &str) -> Result<File, ManifestError> {
        let path = self.write_lock_path(network);
        let file = open_lock_file(&path)?;
        wait_for_lock(&file, &path).await?;
        Ok(file)
    }
}

/// Block on an exclusive lock of `file` off the async executor.
async fn wait_for_lock(file: &File, path: &Path) -> Result<(), ManifestError> {
    let handle = file.try_clone().map_err(|e| ManifestError::io(path, e))?;
    tokio::task::spawn_blocking(move || handle.lock_exclusive())
        .await
        .map_err(|e| ManifestError::io(path, e))?
        .map_err(|e| ManifestError::io(path, e))
}

fn open_lock_file(path: &Path) -> Result<File, ManifestError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| ManifestError::io(path, e))
}

fn write_atomically(path: &Path, manifest: &NetworkManifest) -> Result<(), ManifestError> {
    let json = serde_json::to_string_pretty(manifest).map_err(|e| ManifestError::io(path, e))?;
    let tmp = path.with_extension("json.tmp");

    let mut file = File::create(&tmp).map_err(|e| ManifestError::io(&tmp, e))?;
    file.write_all(json.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| ManifestError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ManifestError::io(path, e))?;
    Ok(())
}

/// Names become file names, so keep them to a safe alphabet.
fn validate_name(name: &str) -> Result<(), ManifestError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidName(name.to_string()))
    }
}
