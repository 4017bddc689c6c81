//! Chain client adapter: the boundary to RPC transport, signing and inclusion.
//!
//! The orchestrator only talks to a chain through [`ChainClient`]. One client is
//! created per network by a [`ChainConnector`].

mod rpc;

use std::future::Future;

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt},
    json_abi::Function,
    primitives::{Address, B256, Bytes, b256},
};

pub use rpc::{RpcChainClient, RpcConnector, json_rpc_call};

use crate::{artifact::DeployableArtifact, network::NetworkDescriptor};

/// ERC-1967 implementation slot: `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// Connectivity problem. The request may not have reached the node.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The transaction is still pending after one wait window.
    #[error("transaction {0} not yet included")]
    InclusionTimeout(B256),
    #[error("transaction {0} reverted")]
    Reverted(B256),
    #[error("receipt for {0} has no contract address")]
    MissingContractAddress(B256),
    #[error("chain id mismatch: expected {expected}, node reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("artifact: {0}")]
    Artifact(String),
    #[error("signer: {0}")]
    Signer(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ChainError {
    /// Errors that a read query may be retried on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::InclusionTimeout(_))
            || matches!(self, Self::Rpc { code, .. } if *code == -32005 || *code == -32603)
    }
}

/// Inclusion receipt of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub contract_address: Option<Address>,
    pub success: bool,
}

impl Receipt {
    /// Address created by a contract-creation transaction.
    pub fn created_address(&self) -> Result<Address, ChainError> {
        if !self.success {
            return Err(ChainError::Reverted(self.transaction_hash));
        }
        self.contract_address
            .ok_or(ChainError::MissingContractAddress(self.transaction_hash))
    }
}

/// Per-network chain capability.
///
/// Methods that submit transactions return as soon as the node accepted the
/// transaction; callers wait with [`ChainClient::await_inclusion`].
pub trait ChainClient: Send + Sync {
    /// Resolve the compiled implementation for `logical_name` at `version`.
    fn resolve_factory(
        &self,
        logical_name: &str,
        version: u64,
    ) -> Result<DeployableArtifact, ChainError>;

    /// Submit a contract creation with the given creation code.
    fn deploy(&self, creation_code: Bytes) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Submit an ERC-1967 proxy pointing at `implementation`, running `init_data` once.
    fn deploy_proxy(
        &self,
        implementation: Address,
        init_data: Bytes,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Submit an upgrade of `proxy` to `new_implementation`.
    fn upgrade_proxy(
        &self,
        proxy: Address,
        new_implementation: Address,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Submit an arbitrary state-changing call.
    fn send(&self, to: Address, calldata: Bytes) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Read-only call.
    fn call(&self, to: Address, calldata: Bytes) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    /// Runtime code deployed at `address`; empty if none.
    fn code_at(&self, address: Address) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    /// Whether any code is deployed at `address`.
    fn has_code(&self, address: Address) -> impl Future<Output = Result<bool, ChainError>> + Send;

    /// Implementation behind an ERC-1967 proxy, or `None` if `proxy` is not one.
    fn implementation_of(
        &self,
        proxy: Address,
    ) -> impl Future<Output = Result<Option<Address>, ChainError>> + Send;

    /// Wait one window for `tx` to be included.
    fn await_inclusion(&self, tx: B256) -> impl Future<Output = Result<Receipt, ChainError>> + Send;
}

/// Creates [`ChainClient`]s for registry entries.
pub trait ChainConnector: Send + Sync {
    type Client: ChainClient;

    fn connect(
        &self,
        network: &NetworkDescriptor,
    ) -> impl Future<Output = Result<Self::Client, ChainError>> + Send;
}

/// Decode an address out of a 32-byte storage word.
pub fn address_from_word(word: B256) -> Option<Address> {
    let address = Address::from_word(word);
    (!address.is_zero()).then_some(address)
}

/// Encode a call to the human-readable `signature` with `args`.
pub fn encode_call(signature: &str, args: &[DynSolValue]) -> Result<Bytes, ChainError> {
    let function = Function::parse(signature)
        .map_err(|e| ChainError::Decode(format!("bad signature `{signature}`: {e}")))?;
    function
        .abi_encode_input(args)
        .map(Bytes::from)
        .map_err(|e| ChainError::Decode(format!("failed to encode `{signature}`: {e}")))
}

/// Decode a single return value of type `ty`.
pub fn decode_return(ty: &DynSolType, data: &[u8]) -> Result<DynSolValue, ChainError> {
    ty.abi_decode(data)
        .map_err(|e| ChainError::Decode(format!("failed to decode `{ty}` return value: {e}")))
}
