//! Append-only audit trail of mutating transitions.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use alloy_core::primitives::{Address, B256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Mutating transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransitionKind {
    FreshDeploy,
    Upgrade,
    ForceImport,
    DirectDeploy,
    RouteRegistration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    Failed(String),
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: u64,
    pub network: String,
    pub contract: String,
    pub kind: TransitionKind,
    pub proxy: Option<Address>,
    pub old_implementation: Option<Address>,
    pub new_implementation: Option<Address>,
    pub transaction_hash: Option<B256>,
    pub outcome: Outcome,
}

impl AuditRecord {
    pub fn new(network: &str, contract: &str, kind: TransitionKind) -> Self {
        Self {
            timestamp: unix_now(),
            network: network.to_string(),
            contract: contract.to_string(),
            kind,
            proxy: None,
            old_implementation: None,
            new_implementation: None,
            transaction_hash: None,
            outcome: Outcome::Succeeded,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Writes [`AuditRecord`]s as JSON lines and mirrors them to the log.
///
/// Without a path, records only go to the log.
#[derive(Debug, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
    write: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a transition. Failing to persist the entry is logged, never propagated.
    pub fn emit(&self, record: &AuditRecord) {
        match &record.outcome {
            Outcome::Succeeded => tracing::info!(
                network = %record.network,
                contract = %record.contract,
                kind = %record.kind,
                proxy = ?record.proxy,
                old_implementation = ?record.old_implementation,
                new_implementation = ?record.new_implementation,
                tx_hash = ?record.transaction_hash,
                "Transition succeeded"
            ),
            Outcome::Failed(err) => tracing::error!(
                network = %record.network,
                contract = %record.contract,
                kind = %record.kind,
                proxy = ?record.proxy,
                old_implementation = ?record.old_implementation,
                new_implementation = ?record.new_implementation,
                tx_hash = ?record.transaction_hash,
                err = %err,
                "Transition failed"
            ),
        }

        if let Err(e) = self.append(record) {
            tracing::error!(err = ?e, "Failed to append audit record");
        }
    }

    fn append(&self, record: &AuditRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let line = serde_json::to_string(record).context("Failed to serialize audit record")?;
        let _guard = self.write.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create audit directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("Failed to open audit log {}", path.display()))?;
        writeln!(file, "{line}").context("Failed to write audit record")?;
        Ok(())
    }

    /// Read back every record in the log file.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read audit log {}", path.display()))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Failed to parse audit record"))
            .collect()
    }
}
