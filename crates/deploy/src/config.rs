//! Layered configuration: built-in defaults, then `Portsmith.toml`, then `PORTSMITH_*` env vars.

use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::ArtifactStore,
    audit::AuditLog,
    manifest::{DeploymentKind, LockMode, ManifestStore},
    network::{NetworkDescriptor, NetworkRegistry},
    orchestrator::ReconcileRequest,
    retry::RetryPolicy,
    route::RouteEntry,
};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILENAME: &str = "Portsmith.toml";

/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "PORTSMITH_";

/// One desired deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub network: String,
    pub contract: String,
    pub version: u64,
    /// Initializer arguments (proxy kind) or constructor arguments (direct kind).
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub kind: DeploymentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_proxy: Option<Address>,
}

impl TargetSpec {
    pub fn request(&self) -> ReconcileRequest {
        ReconcileRequest {
            network: self.network.clone(),
            logical_name: self.contract.clone(),
            desired_version: self.version,
            initializer_params: self.params.clone(),
            known_proxy: self.known_proxy,
        }
    }
}

/// A route to register on a deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub network: String,
    pub contract: String,
    pub chain_id: String,
    pub chain_key: Address,
}

impl RouteSpec {
    pub fn entry(&self) -> RouteEntry {
        RouteEntry {
            chain_id: self.chain_id.clone(),
            chain_key: self.chain_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one manifest file per network.
    pub manifest_dir: PathBuf,
    /// Root of `<Name>/v<version>.json` artifacts.
    pub artifacts_dir: PathBuf,
    /// Artifact of the ERC-1967 proxy deployed in front of implementations.
    pub proxy_artifact: PathBuf,
    /// JSON-lines audit log. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
    pub lock_mode: LockMode,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub networks: Vec<NetworkDescriptor>,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest_dir: PathBuf::from("deployments"),
            artifacts_dir: PathBuf::from("artifacts"),
            proxy_artifact: PathBuf::from("artifacts/ERC1967Proxy.json"),
            audit_log: Some(PathBuf::from("deployments/audit.jsonl")),
            lock_mode: LockMode::default(),
            retry: RetryPolicy::default(),
            networks: Vec::new(),
            targets: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl Config {
    /// Provider stack for `path`; the file is optional.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the configuration. An explicit `path` must exist; without one,
    /// [`DEFAULT_CONFIG_FILENAME`] is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) if path.is_dir() => path.join(DEFAULT_CONFIG_FILENAME),
            Some(path) if !path.exists() => {
                return Err(anyhow::anyhow!(
                    "Configuration file not found: {}",
                    path.display()
                ));
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILENAME),
        };

        let config: Self = Self::figment(&path)
            .extract()
            .context(format!("Failed to load configuration from {}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            networks = config.networks.len(),
            targets = config.targets.len(),
            routes = config.routes.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn registry(&self) -> Result<NetworkRegistry> {
        NetworkRegistry::new(self.networks.iter().cloned())
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.artifacts_dir, &self.proxy_artifact)
    }

    pub fn manifest_store(&self) -> Result<ManifestStore> {
        ManifestStore::open(&self.manifest_dir).context(format!(
            "Failed to open manifest store at {}",
            self.manifest_dir.display()
        ))
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::new(self.audit_log.clone())
    }

    /// Targets on `network` (all networks when `None`), optionally narrowed to one contract.
    pub fn targets_for<'a>(
        &'a self,
        network: Option<&'a str>,
        contract: Option<&'a str>,
    ) -> impl Iterator<Item = &'a TargetSpec> + 'a {
        self.targets.iter().filter(move |t| {
            network.is_none_or(|n| t.network == n) && contract.is_none_or(|c| t.contract == c)
        })
    }

    pub fn routes_for<'a>(&'a self, network: Option<&'a str>) -> impl Iterator<Item = &'a RouteSpec> + 'a {
        self.routes
            .iter()
            .filter(move |r| network.is_none_or(|n| r.network == n))
    }
}
