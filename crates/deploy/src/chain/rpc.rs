//! JSON-RPC implementation of the chain client adapter.

use std::time::{Duration, Instant};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, U64},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use super::{
    ChainClient, ChainConnector, ChainError, IMPLEMENTATION_SLOT, Receipt, address_from_word,
    encode_call,
};
use crate::{
    artifact::{ArtifactStore, DeployableArtifact},
    network::NetworkDescriptor,
};

/// Default timeout for a single RPC request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time one [`ChainClient::await_inclusion`] call keeps polling.
const DEFAULT_INCLUSION_WINDOW: Duration = Duration::from_secs(60);

/// Default interval between receipt polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Make a JSON-RPC call and deserialize the result.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, ChainError> {
    let response = client
        .post(url.clone())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| ChainError::Transport(format!("{method}: {e}")))?;

    let result: Value = response
        .json()
        .await
        .map_err(|e| ChainError::Transport(format!("{method}: failed to read response: {e}")))?;

    if let Some(error) = result.get("error") {
        return Err(ChainError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| ChainError::Decode(format!("{method}: no result in response")))?;

    serde_json::from_value(result_value)
        .map_err(|e| ChainError::Decode(format!("{method}: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: U64,
    contract_address: Option<Address>,
    status: U64,
}

impl From<RpcReceipt> for Receipt {
    fn from(r: RpcReceipt) -> Self {
        Self {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number.to::<u64>(),
            contract_address: r.contract_address,
            success: r.status == U64::from(1),
        }
    }
}

/// Builds [`RpcChainClient`]s from registry entries.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    artifacts: ArtifactStore,
    request_timeout: Duration,
    inclusion_window: Duration,
    poll_interval: Duration,
}

impl RpcConnector {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self {
            artifacts,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inclusion_window: DEFAULT_INCLUSION_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn inclusion_window(mut self, window: Duration) -> Self {
        self.inclusion_window = window;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl ChainConnector for RpcConnector {
    type Client = RpcChainClient;

    async fn connect(&self, network: &NetworkDescriptor) -> Result<RpcChainClient, ChainError> {
        let from = network
            .signer_credential
            .address()
            .map_err(|e| ChainError::Signer(format!("{e:#}")))?;

        let http = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to create HTTP client: {e}")))?;

        let client = RpcChainClient {
            http,
            url: network.rpc_endpoint.clone(),
            from,
            expected_chain_id: network.chain_id,
            chain_verified: OnceCell::new(),
            artifacts: self.artifacts.clone(),
            inclusion_window: self.inclusion_window,
            poll_interval: self.poll_interval,
        };

        tracing::debug!(
            network = %network.name,
            rpc = %network.rpc_endpoint,
            from = %from,
            "Chain client connected"
        );

        Ok(client)
    }
}

/// Chain client over Ethereum JSON-RPC.
///
/// Transactions are submitted with `eth_sendTransaction` from the signer's address;
/// the node (or the signing middleware in front of it) holds the key.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    http: reqwest::Client,
    url: Url,
    from: Address,
    expected_chain_id: Option<u64>,
    chain_verified: OnceCell<()>,
    artifacts: ArtifactStore,
    inclusion_window: Duration,
    poll_interval: Duration,
}

impl RpcChainClient {
    async fn rpc<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, ChainError> {
        json_rpc_call(&self.http, &self.url, method, params).await
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        let id: U64 = self.rpc("eth_chainId", vec![]).await?;
        Ok(id.to::<u64>())
    }

    /// Check the node's chain id against the registry, once per client.
    async fn verify_chain(&self) -> Result<(), ChainError> {
        let Some(expected) = self.expected_chain_id else {
            return Ok(());
        };
        self.chain_verified
            .get_or_try_init(|| async {
                let actual = self.chain_id().await?;
                if actual != expected {
                    return Err(ChainError::ChainIdMismatch { expected, actual });
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn send_transaction(&self, to: Option<Address>, data: Bytes) -> Result<B256, ChainError> {
        self.verify_chain().await?;

        let mut tx = serde_json::json!({
            "from": self.from,
            "data": data,
        });
        if let Some(to) = to {
            tx["to"] = serde_json::json!(to);
        }

        let hash: B256 = self.rpc("eth_sendTransaction", vec![tx]).await?;
        tracing::debug!(tx_hash = %hash, to = ?to, "Transaction submitted");
        Ok(hash)
    }
}

impl ChainClient for RpcChainClient {
    fn resolve_factory(
        &self,
        logical_name: &str,
        version: u64,
    ) -> Result<DeployableArtifact, ChainError> {
        self.artifacts
            .resolve(logical_name, version)
            .map_err(|e| ChainError::Artifact(format!("{e:#}")))
    }

    async fn deploy(&self, creation_code: Bytes) -> Result<B256, ChainError> {
        self.send_transaction(None, creation_code).await
    }

    async fn deploy_proxy(&self, implementation: Address, init_data: Bytes) -> Result<B256, ChainError> {
        let proxy = self
            .artifacts
            .proxy()
            .map_err(|e| ChainError::Artifact(format!("{e:#}")))?;
        let code = proxy
            .creation_code_with(&[
                DynSolValue::Address(implementation),
                DynSolValue::Bytes(init_data.to_vec()),
            ])
            .map_err(|e| ChainError::Artifact(e.to_string()))?;
        self.send_transaction(None, code).await
    }

    async fn upgrade_proxy(&self, proxy: Address, new_implementation: Address) -> Result<B256, ChainError> {
        let calldata = encode_call(
            "function upgradeToAndCall(address newImplementation, bytes data)",
            &[
                DynSolValue::Address(new_implementation),
                DynSolValue::Bytes(Vec::new()),
            ],
        )?;
        self.send_transaction(Some(proxy), calldata).await
    }

    async fn send(&self, to: Address, calldata: Bytes) -> Result<B256, ChainError> {
        self.send_transaction(Some(to), calldata).await
    }

    async fn call(&self, to: Address, calldata: Bytes) -> Result<Bytes, ChainError> {
        self.rpc(
            "eth_call",
            vec![
                serde_json::json!({ "from": self.from, "to": to, "data": calldata }),
                serde_json::json!("latest"),
            ],
        )
        .await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.rpc(
            "eth_getCode",
            vec![serde_json::json!(address), serde_json::json!("latest")],
        )
        .await
    }

    async fn has_code(&self, address: Address) -> Result<bool, ChainError> {
        Ok(!self.code_at(address).await?.is_empty())
    }

    async fn implementation_of(&self, proxy: Address) -> Result<Option<Address>, ChainError> {
        if !self.has_code(proxy).await? {
            return Ok(None);
        }
        let word: B256 = self
            .rpc(
                "eth_getStorageAt",
                vec![
                    serde_json::json!(proxy),
                    serde_json::json!(IMPLEMENTATION_SLOT),
                    serde_json::json!("latest"),
                ],
            )
            .await?;
        Ok(address_from_word(word))
    }

    async fn await_inclusion(&self, tx: B256) -> Result<Receipt, ChainError> {
        let start = Instant::now();

        loop {
            let receipt: Option<RpcReceipt> = self
                .rpc("eth_getTransactionReceipt", vec![serde_json::json!(tx)])
                .await?;

            if let Some(receipt) = receipt {
                let receipt = Receipt::from(receipt);
                tracing::debug!(
                    tx_hash = %tx,
                    block = receipt.block_number,
                    success = receipt.success,
                    "Transaction included"
                );
                return Ok(receipt);
            }

            if start.elapsed() > self.inclusion_window {
                return Err(ChainError::InclusionTimeout(tx));
            }

            tracing::trace!(tx_hash = %tx, "Receipt not available yet, polling...");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
