//! Error taxonomy for reconciliation and route registration.
//!
//! Every error carries the network and logical contract name it belongs to, so that
//! batch runs over many networks can report per-network outcomes independently.

use alloy_core::primitives::{Address, B256};
use serde::Serialize;

use crate::{
    chain::ChainError,
    manifest::{DeploymentKind, ManifestError},
};

/// Coarse classification of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Bad caller input, or an address that does not hold what was asked for. Nothing was submitted.
    Input,
    /// Connectivity or inclusion delays. Retry later, once any pending transaction has settled.
    Transient,
    /// Chain state changed but the manifest could not be brought along.
    PartialFailure,
    /// Another reconciliation holds the key.
    Concurrency,
    /// The manifest cannot be trusted. Nothing mutating may proceed.
    Fatal,
}

/// On-chain addresses observed before a transition stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedAddresses {
    pub implementation: Option<Address>,
    pub proxy: Option<Address>,
    pub pending_transaction: Option<B256>,
}

impl std::fmt::Display for ObservedAddresses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |a: Option<Address>| a.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "implementation={} proxy={}",
            show(self.implementation),
            show(self.proxy)
        )?;
        if let Some(tx) = self.pending_transaction {
            write!(f, " pending_tx={tx}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("network is not in the registry")]
    UnknownNetwork,

    #[error("implementation version {version} cannot be resolved: {reason}")]
    UnresolvableImplementation { version: u64, reason: String },

    #[error("initializer expects {expected} argument(s), got {actual}")]
    InitializerArityMismatch { expected: usize, actual: usize },

    #[error("initializer argument {index} is not a valid `{expected}`: {reason}")]
    InitializerTypeMismatch {
        index: usize,
        expected: String,
        reason: String,
    },

    #[error("deployment incomplete ({observed}): {reason}")]
    DeploymentIncomplete {
        observed: ObservedAddresses,
        reason: String,
    },

    #[error(
        "upgrade verification failed for proxy {proxy}: expected implementation {expected}, chain reports {}",
        actual.map(|a| a.to_string()).unwrap_or_else(|| "none".into())
    )]
    UpgradeVerificationFailed {
        proxy: Address,
        expected: Address,
        actual: Option<Address>,
        observed: ObservedAddresses,
    },

    #[error("another reconciliation is in progress for this contract")]
    ReconciliationInProgress,

    #[error("transaction {tx_hash} not included within the retry budget ({observed})")]
    InclusionTimeout {
        tx_hash: B256,
        observed: ObservedAddresses,
    },

    #[error("chain client error: {0}")]
    Chain(#[source] ChainError),

    #[error("no deployment recorded for this contract")]
    NoRecord,

    #[error("no valid proxy found at {address}")]
    ProxyNotFound { address: Address },

    /// The proxy points at code that matches no known artifact version.
    #[error(
        "implementation {implementation} behind proxy {proxy} matches no known version; import it with an explicit version"
    )]
    UnidentifiedImplementation {
        proxy: Address,
        implementation: Address,
    },

    #[error("deployment at {address} is a direct deployment and cannot be upgraded")]
    NotUpgradeable { address: Address },

    #[error("contract is already recorded as a {existing} deployment")]
    KindConflict { existing: DeploymentKind },

    #[error("refusing to move from version {current} back to {desired}")]
    VersionRegression { current: u64, desired: u64 },

    #[error("cancelled before any transaction was submitted")]
    Cancelled,

    #[error("route registration failed: {0}")]
    RouteRegistrationFailed(#[source] ChainError),

    #[error("chain key {chain_key} was rejected by the port contract")]
    InvalidChainKey { chain_key: Address },

    #[error("manifest store: {0}")]
    Manifest(#[source] ManifestError),
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownNetwork
            | Self::UnresolvableImplementation { .. }
            | Self::InitializerArityMismatch { .. }
            | Self::InitializerTypeMismatch { .. }
            | Self::NotUpgradeable { .. }
            | Self::KindConflict { .. }
            | Self::NoRecord
            | Self::VersionRegression { .. }
            | Self::InvalidChainKey { .. }
            | Self::ProxyNotFound { .. }
            | Self::UnidentifiedImplementation { .. }
            | Self::Cancelled => ErrorClass::Input,
            Self::InclusionTimeout { .. } | Self::Chain(_) | Self::RouteRegistrationFailed(_) => {
                ErrorClass::Transient
            }
            Self::DeploymentIncomplete { .. } | Self::UpgradeVerificationFailed { .. } => {
                ErrorClass::PartialFailure
            }
            Self::ReconciliationInProgress => ErrorClass::Concurrency,
            Self::Manifest(ManifestError::InProgress { .. }) => ErrorClass::Concurrency,
            Self::Manifest(_) => ErrorClass::Fatal,
        }
    }

    /// Whether re-running the same operation later is safe without manual reconciliation.
    ///
    /// An inclusion timeout is transient but not retryable: the pending transaction
    /// may still land, so the caller waits for it instead of submitting again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Chain(e) | Self::RouteRegistrationFailed(e) => e.is_transient(),
            Self::ReconciliationInProgress => true,
            _ => false,
        }
    }

    /// Addresses that made it on chain before the failure, if any.
    pub fn observed(&self) -> Option<&ObservedAddresses> {
        match self {
            Self::DeploymentIncomplete { observed, .. }
            | Self::UpgradeVerificationFailed { observed, .. }
            | Self::InclusionTimeout { observed, .. } => Some(observed),
            _ => None,
        }
    }
}

/// A failed operation against one (network, contract) pair.
#[derive(Debug, thiserror::Error)]
#[error("[{network}/{contract}] {kind}")]
pub struct Error {
    pub network: String,
    pub contract: String,
    #[source]
    pub kind: ErrorKind,
}

impl Error {
    pub fn new(network: impl Into<String>, contract: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            network: network.into(),
            contract: contract.into(),
            kind,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_names_network_and_contract() {
        let err = Error::new("bevm", "OmnityPortContract", ErrorKind::UnknownNetwork);
        let msg = err.to_string();
        assert!(msg.contains("bevm"));
        assert!(msg.contains("OmnityPortContract"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(ErrorKind::UnknownNetwork.class(), ErrorClass::Input);
        assert_eq!(
            ErrorKind::ReconciliationInProgress.class(),
            ErrorClass::Concurrency
        );
        assert_eq!(
            ErrorKind::DeploymentIncomplete {
                observed: ObservedAddresses::default(),
                reason: "boom".into()
            }
            .class(),
            ErrorClass::PartialFailure
        );
        assert_eq!(
            ErrorKind::Manifest(ManifestError::Corrupted {
                path: "x.json".into(),
                reason: "eof".into()
            })
            .class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_partial_failures_are_not_retryable() {
        let kind = ErrorKind::UpgradeVerificationFailed {
            proxy: Address::ZERO,
            expected: Address::repeat_byte(1),
            actual: None,
            observed: ObservedAddresses::default(),
        };
        assert!(!kind.is_retryable());
        assert!(kind.observed().is_some());
        assert!(ErrorKind::Chain(ChainError::Transport("reset".into())).is_retryable());
    }

    #[test]
    fn test_class_agrees_with_retryability() {
        let missing = ErrorKind::ProxyNotFound {
            address: Address::repeat_byte(0xaa),
        };
        assert_eq!(missing.class(), ErrorClass::Input);
        assert!(!missing.is_retryable());

        let unknown = ErrorKind::UnidentifiedImplementation {
            proxy: Address::repeat_byte(0xaa),
            implementation: Address::repeat_byte(0xbb),
        };
        assert_eq!(unknown.class(), ErrorClass::Input);
        assert!(!unknown.is_retryable());

        let pending = ErrorKind::InclusionTimeout {
            tx_hash: B256::repeat_byte(1),
            observed: ObservedAddresses {
                pending_transaction: Some(B256::repeat_byte(1)),
                ..Default::default()
            },
        };
        assert_eq!(pending.class(), ErrorClass::Transient);
        assert!(!pending.is_retryable());
        assert!(pending.observed().is_some());
    }
}
