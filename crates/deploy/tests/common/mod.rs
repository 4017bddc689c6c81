//! In-memory chain used by the integration tests.
//!
//! Each [`MockChain`] models one network: contract code, ERC-1967 implementation
//! slots, receipts and port-contract routes, plus switches to inject failures.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    json_abi::Function,
    primitives::{Address, B256, Bytes, keccak256},
};
use portsmith_deploy::{
    AuditLog, ChainClient, ChainConnector, ChainError, DeployableArtifact, LockMode,
    ManifestStore, NetworkDescriptor, NetworkRegistry, Orchestrator, Receipt, RetryPolicy,
    SignerCredential,
};
use tempdir::TempDir;

pub const PORT: &str = "OmnityPortContract";
pub const LEGACY_PORT: &str = "OmnityPortLegacy";

/// Counterparty chain-key used across scenarios.
pub const CHAIN_KEY: &str = "0x45584a4f8ee6b7ac2fd9c9ebb2bdb0b9d4c8207e";
pub const MINER_PUBKEY: &str = "0x033965f4d0c44b21c3694a933f91fb0ca5b05c114264aa3de8fd00f8172bfda629";

const PORT_V1: &str = r#"{
    "contractName": "OmnityPortContract",
    "abi": [
        {"type": "function", "name": "initialize", "stateMutability": "nonpayable",
         "inputs": [{"name": "chainKey", "type": "address", "internalType": "address"}],
         "outputs": []}
    ],
    "bytecode": "0x60806040520001",
    "deployedBytecode": "0x60806040527300000000000000000000000000000000000000000000000000000000000000005b01"
}"#;

const PORT_V2: &str = r#"{
    "contractName": "OmnityPortContract",
    "abi": [
        {"type": "function", "name": "initialize", "stateMutability": "nonpayable",
         "inputs": [
            {"name": "minerPubkey", "type": "bytes", "internalType": "bytes"},
            {"name": "chainKey", "type": "address", "internalType": "address"},
            {"name": "chainId", "type": "string", "internalType": "string"}
         ],
         "outputs": []}
    ],
    "bytecode": "0x60806040520002",
    "deployedBytecode": "0x60806040527300000000000000000000000000000000000000000000000000000000000000005b02"
}"#;

const PORT_V3: &str = r#"{
    "contractName": "OmnityPortContract",
    "abi": [
        {"type": "function", "name": "initialize", "stateMutability": "nonpayable",
         "inputs": [{"name": "chainKey", "type": "address", "internalType": "address"}],
         "outputs": []}
    ],
    "bytecode": "0x60806040520003",
    "deployedBytecode": "0x60806040527300000000000000000000000000000000000000000000000000000000000000005b03"
}"#;

const LEGACY_V1: &str = r#"{
    "contractName": "OmnityPortLegacy",
    "abi": [
        {"type": "constructor", "stateMutability": "nonpayable",
         "inputs": [{"name": "chainKey", "type": "address", "internalType": "address"}]}
    ],
    "bytecode": "0x60806040520101",
    "deployedBytecode": "0x60806040527300000000000000000000000000000000000000000000000000000000000000005b11"
}"#;

/// Runtime code of every proxy the mock deploys.
const PROXY_CODE: &[u8] = &[0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d, 0x3d, 0x36, 0x3d, 0x73];

const CHAIN_KEY_OF: &str = "function chainKeyOf(string chainId) returns (address)";
const IS_VALID_CHAIN_KEY: &str = "function isValidChainKey(address key) returns (bool)";
const REGISTER_ROUTE: &str = "function registerRoute(string chainId, address key)";

/// Failure switches of a [`MockChain`].
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// The node rejects proxy deployments.
    pub reject_deploy_proxy: bool,
    /// Proxy deployments are accepted but never included.
    pub stall_proxy_inclusion: bool,
    /// Upgrade transactions are included but leave the slot untouched.
    pub ignore_upgrades: bool,
    /// Number of upcoming implementation slot reads failing with a transport error.
    pub transient_reads: usize,
    /// Every implementation slot read fails with a transport error.
    pub unreadable_slots: bool,
    /// The next included upgrade turns on `unreadable_slots`.
    pub unreadable_after_upgrade: bool,
    /// The node rejects every submission with a connection error.
    pub offline_submissions: bool,
    /// Chain keys the port contract refuses.
    pub rejected_keys: Vec<Address>,
}

/// A state-changing call the chain accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Deploy { address: Address },
    DeployProxy { proxy: Address, implementation: Address },
    Upgrade { proxy: Address, implementation: Address },
    Send { to: Address },
}

#[derive(Debug, Default)]
struct State {
    nonce: u64,
    code: HashMap<Address, Bytes>,
    slots: HashMap<Address, Address>,
    receipts: HashMap<B256, Receipt>,
    stalled: HashSet<B256>,
    routes: HashMap<(Address, String), Address>,
    submissions: Vec<Submission>,
    initializations: Vec<(Address, Bytes)>,
    faults: Faults,
}

impl State {
    fn next(&mut self, network: &str) -> (Address, B256) {
        self.nonce += 1;
        let address = Address::from_word(keccak256(format!("{network}:address:{}", self.nonce)));
        let tx = keccak256(format!("{network}:tx:{}", self.nonce));
        (address, tx)
    }

    fn include(&mut self, tx: B256, contract_address: Option<Address>) {
        let block_number = self.nonce;
        self.receipts.insert(
            tx,
            Receipt {
                transaction_hash: tx,
                block_number,
                contract_address,
                success: true,
            },
        );
    }
}

/// One simulated network.
#[derive(Debug)]
pub struct MockChain {
    name: String,
    state: Mutex<State>,
    artifacts: HashMap<(String, u64), DeployableArtifact>,
}

impl MockChain {
    pub fn new(name: &str) -> Arc<Self> {
        let mut artifacts = HashMap::new();
        for (logical_name, version, json) in [
            (PORT, 1, PORT_V1),
            (PORT, 2, PORT_V2),
            (PORT, 3, PORT_V3),
            (LEGACY_PORT, 1, LEGACY_V1),
        ] {
            let mut artifact = DeployableArtifact::from_hardhat_json(version, json).unwrap();
            artifact.logical_name = logical_name.to_string();
            artifacts.insert((logical_name.to_string(), version), artifact);
        }
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            artifacts,
        })
    }

    fn artifact(&self, logical_name: &str, version: u64) -> &DeployableArtifact {
        &self.artifacts[&(logical_name.to_string(), version)]
    }

    /// Runtime code a deployment of `creation_code` leaves at `address`.
    fn runtime_code(&self, creation_code: &[u8], address: Address) -> Bytes {
        let Some(artifact) = self
            .artifacts
            .values()
            .find(|a| creation_code.starts_with(&a.bytecode))
        else {
            return Bytes::copy_from_slice(creation_code);
        };
        let mut code = artifact.deployed_bytecode.to_vec();
        // Fill the immutable word, as a constructor would.
        if let Some(start) = code.windows(32).position(|w| w.iter().all(|b| *b == 0)) {
            code[start..start + 32].copy_from_slice(keccak256(address).as_slice());
        }
        code.into()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn faults(&self, configure: impl FnOnce(&mut Faults)) {
        configure(&mut self.state().faults);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn proxy_deployments(&self) -> usize {
        self.submissions()
            .iter()
            .filter(|s| matches!(s, Submission::DeployProxy { .. }))
            .count()
    }

    pub fn slot(&self, proxy: Address) -> Option<Address> {
        self.state().slots.get(&proxy).copied()
    }

    pub fn has_contract(&self, address: Address) -> bool {
        self.state().code.contains_key(&address)
    }

    pub fn initializations(&self) -> Vec<(Address, Bytes)> {
        self.state().initializations.clone()
    }

    pub fn route(&self, contract: Address, chain_id: &str) -> Option<Address> {
        self.state()
            .routes
            .get(&(contract, chain_id.to_string()))
            .copied()
    }

    /// Put a proxy and a port contract implementation at `version` on chain
    /// without going through a client.
    pub fn install_proxy(&self, version: u64) -> (Address, Address) {
        let implementation = self.install_implementation(version);
        let mut state = self.state();
        let (proxy, _) = state.next(&self.name);
        state.code.insert(proxy, Bytes::from_static(PROXY_CODE));
        state.slots.insert(proxy, implementation);
        (proxy, implementation)
    }

    fn install_implementation(&self, version: u64) -> Address {
        let bytecode = self.artifact(PORT, version).bytecode.clone();
        let address = self.state().next(&self.name).0;
        let code = self.runtime_code(&bytecode, address);
        self.state().code.insert(address, code);
        address
    }

    /// Point `proxy` at code built from no known artifact, behind the manifest's back.
    pub fn upgrade_out_of_band(&self, proxy: Address) -> Address {
        let mut state = self.state();
        let (implementation, _) = state.next(&self.name);
        let code = keccak256(format!("{}:foreign:{implementation}", self.name));
        state.code.insert(implementation, Bytes::copy_from_slice(code.as_slice()));
        state.slots.insert(proxy, implementation);
        implementation
    }

    /// Point `proxy` at a fresh port contract implementation at `version`, behind the manifest's back.
    pub fn upgrade_out_of_band_to(&self, proxy: Address, version: u64) -> Address {
        let implementation = self.install_implementation(version);
        self.state().slots.insert(proxy, implementation);
        implementation
    }

    /// Remove every trace of the contract at `address`, as after a chain reset.
    pub fn wipe(&self, address: Address) {
        let mut state = self.state();
        state.code.remove(&address);
        state.slots.remove(&address);
    }

    fn submission_allowed(&self) -> Result<(), ChainError> {
        if self.state().faults.offline_submissions {
            return Err(ChainError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

fn selector_matches(signature: &str, calldata: &[u8]) -> bool {
    let function = Function::parse(signature).unwrap();
    calldata.len() >= 4 && calldata[..4] == function.selector()[..]
}

fn decode_args(types: Vec<DynSolType>, calldata: &[u8]) -> Result<Vec<DynSolValue>, ChainError> {
    match DynSolType::Tuple(types).abi_decode_params(&calldata[4..]) {
        Ok(DynSolValue::Tuple(values)) => Ok(values),
        Ok(other) => Err(ChainError::Decode(format!("unexpected arguments {other:?}"))),
        Err(e) => Err(ChainError::Decode(e.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct MockClient {
    chain: Arc<MockChain>,
}

impl ChainClient for MockClient {
    fn resolve_factory(&self, logical_name: &str, version: u64) -> Result<DeployableArtifact, ChainError> {
        self.chain
            .artifacts
            .get(&(logical_name.to_string(), version))
            .cloned()
            .ok_or_else(|| ChainError::Artifact(format!("no artifact for {logical_name} v{version}")))
    }

    async fn deploy(&self, creation_code: Bytes) -> Result<B256, ChainError> {
        tokio::task::yield_now().await;
        self.chain.submission_allowed()?;
        if creation_code.is_empty() {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "empty creation code".into(),
            });
        }

        let mut state = self.chain.state();
        let (address, tx) = state.next(&self.chain.name);
        state
            .code
            .insert(address, self.chain.runtime_code(&creation_code, address));
        state.include(tx, Some(address));
        state.submissions.push(Submission::Deploy { address });
        Ok(tx)
    }

    async fn deploy_proxy(&self, implementation: Address, init_data: Bytes) -> Result<B256, ChainError> {
        tokio::task::yield_now().await;
        self.chain.submission_allowed()?;

        let mut state = self.chain.state();
        if state.faults.reject_deploy_proxy {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "insufficient funds for gas".into(),
            });
        }

        let (proxy, tx) = state.next(&self.chain.name);
        state.code.insert(proxy, Bytes::from_static(PROXY_CODE));
        state.slots.insert(proxy, implementation);
        state.initializations.push((proxy, init_data));
        state.submissions.push(Submission::DeployProxy {
            proxy,
            implementation,
        });
        if state.faults.stall_proxy_inclusion {
            state.stalled.insert(tx);
        } else {
            state.include(tx, Some(proxy));
        }
        Ok(tx)
    }

    async fn upgrade_proxy(&self, proxy: Address, new_implementation: Address) -> Result<B256, ChainError> {
        tokio::task::yield_now().await;
        self.chain.submission_allowed()?;

        let mut state = self.chain.state();
        let (_, tx) = state.next(&self.chain.name);
        if !state.faults.ignore_upgrades {
            state.slots.insert(proxy, new_implementation);
        }
        if state.faults.unreadable_after_upgrade {
            state.faults.unreadable_slots = true;
        }
        state.include(tx, None);
        state.submissions.push(Submission::Upgrade {
            proxy,
            implementation: new_implementation,
        });
        Ok(tx)
    }

    async fn send(&self, to: Address, calldata: Bytes) -> Result<B256, ChainError> {
        tokio::task::yield_now().await;
        self.chain.submission_allowed()?;

        if !selector_matches(REGISTER_ROUTE, &calldata) {
            return Err(ChainError::Rpc {
                code: 3,
                message: "execution reverted: unknown selector".into(),
            });
        }
        let args = decode_args(vec![DynSolType::String, DynSolType::Address], &calldata)?;

        let mut state = self.chain.state();
        let (_, tx) = state.next(&self.chain.name);
        if let [DynSolValue::String(chain_id), DynSolValue::Address(key)] = args.as_slice() {
            state.routes.insert((to, chain_id.clone()), *key);
        }
        state.include(tx, None);
        state.submissions.push(Submission::Send { to });
        Ok(tx)
    }

    async fn call(&self, to: Address, calldata: Bytes) -> Result<Bytes, ChainError> {
        let state = self.chain.state();
        if !state.code.contains_key(&to) {
            return Ok(Bytes::new());
        }

        if selector_matches(CHAIN_KEY_OF, &calldata) {
            let args = decode_args(vec![DynSolType::String], &calldata)?;
            let key = match args.as_slice() {
                [DynSolValue::String(chain_id)] => state
                    .routes
                    .get(&(to, chain_id.clone()))
                    .copied()
                    .unwrap_or(Address::ZERO),
                _ => Address::ZERO,
            };
            return Ok(DynSolValue::Address(key).abi_encode().into());
        }

        if selector_matches(IS_VALID_CHAIN_KEY, &calldata) {
            let args = decode_args(vec![DynSolType::Address], &calldata)?;
            let valid = match args.as_slice() {
                [DynSolValue::Address(key)] => {
                    !key.is_zero() && !state.faults.rejected_keys.contains(key)
                }
                _ => false,
            };
            return Ok(DynSolValue::Bool(valid).abi_encode().into());
        }

        Err(ChainError::Rpc {
            code: 3,
            message: "execution reverted".into(),
        })
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        Ok(self.chain.state().code.get(&address).cloned().unwrap_or_default())
    }

    async fn has_code(&self, address: Address) -> Result<bool, ChainError> {
        Ok(self.chain.has_contract(address))
    }

    async fn implementation_of(&self, proxy: Address) -> Result<Option<Address>, ChainError> {
        let mut state = self.chain.state();
        if state.faults.unreadable_slots {
            return Err(ChainError::Transport("connection reset by peer".into()));
        }
        if state.faults.transient_reads > 0 {
            state.faults.transient_reads -= 1;
            return Err(ChainError::Transport("connection reset by peer".into()));
        }
        if !state.code.contains_key(&proxy) {
            return Ok(None);
        }
        Ok(state.slots.get(&proxy).copied())
    }

    async fn await_inclusion(&self, tx: B256) -> Result<Receipt, ChainError> {
        let state = self.chain.state();
        if state.stalled.contains(&tx) {
            return Err(ChainError::InclusionTimeout(tx));
        }
        state.receipts.get(&tx).cloned().ok_or(ChainError::Rpc {
            code: -32000,
            message: format!("unknown transaction {tx}"),
        })
    }
}

/// Hands out clients for the networks it knows about.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    chains: HashMap<String, Arc<MockChain>>,
}

impl ChainConnector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, network: &NetworkDescriptor) -> Result<MockClient, ChainError> {
        let chain = self
            .chains
            .get(&network.name)
            .cloned()
            .ok_or_else(|| ChainError::Transport(format!("no route to {}", network.rpc_endpoint)))?;
        Ok(MockClient { chain })
    }
}

pub fn descriptor(name: &str) -> NetworkDescriptor {
    NetworkDescriptor {
        name: name.to_string(),
        rpc_endpoint: "http://localhost:8545".parse().unwrap(),
        signer_credential: SignerCredential::Env("PORTSMITH_TEST_KEY".to_string()),
        chain_id: None,
    }
}

/// A set of mock networks plus an orchestrator over them, rooted in a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub chains: HashMap<String, Arc<MockChain>>,
    pub orchestrator: Orchestrator<MockConnector>,
}

impl Harness {
    pub fn new(networks: &[&str]) -> Self {
        Self::with_lock_mode(networks, LockMode::Wait)
    }

    pub fn with_lock_mode(networks: &[&str], lock_mode: LockMode) -> Self {
        init_test_tracing();
        let dir = TempDir::new("portsmith-it").unwrap();
        let chains: HashMap<_, _> = networks
            .iter()
            .map(|n| (n.to_string(), MockChain::new(n)))
            .collect();
        let orchestrator = build_orchestrator(&dir, &chains, lock_mode);
        Self {
            dir,
            chains,
            orchestrator,
        }
    }

    pub fn chain(&self, network: &str) -> &Arc<MockChain> {
        &self.chains[network]
    }

    /// A second orchestrator over the same manifest directory and chains, as another process would see them.
    pub fn reopen(&self) -> Orchestrator<MockConnector> {
        build_orchestrator(&self.dir, &self.chains, LockMode::Wait)
    }

    pub fn audit_path(&self) -> std::path::PathBuf {
        self.dir.path().join("audit.jsonl")
    }
}

fn build_orchestrator(
    dir: &TempDir,
    chains: &HashMap<String, Arc<MockChain>>,
    lock_mode: LockMode,
) -> Orchestrator<MockConnector> {
    let registry = NetworkRegistry::new(chains.keys().map(|n| descriptor(n))).unwrap();
    let connector = MockConnector {
        chains: chains.clone(),
    };
    let store = ManifestStore::open(dir.path().join("manifests")).unwrap();
    let retry = RetryPolicy {
        inclusion_attempts: 2,
        ..RetryPolicy::immediate()
    };

    Orchestrator::new(registry, connector, store)
        .audit_log(AuditLog::new(Some(dir.path().join("audit.jsonl"))))
        .retry_policy(retry)
        .lock_mode(lock_mode)
}

/// A client for `network`, bypassing the orchestrator.
pub fn client(harness: &Harness, network: &str) -> MockClient {
    MockClient {
        chain: harness.chain(network).clone(),
    }
}

/// Initialize tracing for tests (idempotent).
fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}
