//! portsmith-deploy - Multi-network proxy deployment orchestration.
//!
//! This crate keeps one logical contract deployed behind a stable ERC-1967 proxy on
//! many independent EVM networks, deciding per network between a fresh deploy, an
//! upgrade, a no-op, or re-adopting a proxy whose bookkeeping was lost.

mod artifact;
pub use artifact::{ArgumentError, ArtifactStore, DeployableArtifact, INITIALIZER};

mod audit;
pub use audit::{AuditLog, AuditRecord, Outcome, TransitionKind, unix_now};

mod cancel;
pub use cancel::{CancelHandle, Cancellation};

pub mod chain;
pub use chain::{ChainClient, ChainConnector, ChainError, Receipt, RpcChainClient, RpcConnector};

mod config;
pub use config::{Config, DEFAULT_CONFIG_FILENAME, ENV_PREFIX, RouteSpec, TargetSpec};

mod error;
pub use error::{Error, ErrorClass, ErrorKind, ObservedAddresses};

mod manifest;
pub use manifest::{
    DeploymentKind, KeyLease, LockMode, MANIFEST_FORMAT, ManifestError, ManifestStore,
    NetworkManifest, ProxyRecord, RecordKey, RecordOrigin,
};

mod network;
pub use network::{NetworkDescriptor, NetworkRegistry, SignerCredential};

mod orchestrator;
pub use orchestrator::{Action, BatchOutcome, Orchestrator, ReconcileRequest};

mod retry;
pub use retry::RetryPolicy;

mod route;
pub use route::{RouteEntry, RouteRegistrar, RouteStatus};
