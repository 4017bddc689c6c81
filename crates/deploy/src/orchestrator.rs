//! Deployment orchestrator.
//!
//! For one `(network, logical name)` pair, [`Orchestrator::reconcile`] detects the
//! current state from the manifest and the chain, then runs exactly one transition:
//!
//! | detected state                 | transition            |
//! |--------------------------------|-----------------------|
//! | no record                      | fresh deploy          |
//! | record, version current        | none                  |
//! | record, version stale          | upgrade               |
//! | record inconsistent with chain | force import          |
//!
//! Detection only reads. Writes start after the state is known, and the manifest
//! is updated only after the chain confirms the change.

use std::{cmp::Ordering, fmt};

use alloy_core::primitives::{Address, Bytes};
use futures::future::join_all;

use crate::{
    artifact::{ArgumentError, DeployableArtifact},
    audit::{AuditLog, AuditRecord, Outcome, TransitionKind, unix_now},
    cancel::Cancellation,
    chain::{ChainClient, ChainConnector, ChainError},
    error::{Error, ErrorKind, ObservedAddresses},
    manifest::{
        DeploymentKind, KeyLease, LockMode, ManifestError, ManifestStore, ProxyRecord,
        RecordKey, RecordOrigin,
    },
    network::NetworkRegistry,
    retry::RetryPolicy,
    route::{RouteEntry, RouteRegistrar, RouteStatus},
};

/// Desired state of one logical contract on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub network: String,
    pub logical_name: String,
    pub desired_version: u64,
    /// Arguments for `initialize`, in declaration order.
    pub initializer_params: Vec<String>,
    /// Proxy address known out of band, used to recover a lost or broken record.
    pub known_proxy: Option<Address>,
}

impl ReconcileRequest {
    pub fn new(network: impl Into<String>, logical_name: impl Into<String>, desired_version: u64) -> Self {
        Self {
            network: network.into(),
            logical_name: logical_name.into(),
            desired_version,
            initializer_params: Vec::new(),
            known_proxy: None,
        }
    }

    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initializer_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn known_proxy(mut self, proxy: Address) -> Self {
        self.known_proxy = Some(proxy);
        self
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    FreshDeploy,
    Upgrade,
    ForceImport,
    DirectDeploy,
    Unchanged,
}

/// Result of one request of a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub request: ReconcileRequest,
    pub result: Result<(Action, ProxyRecord), Error>,
}

/// State of a key as seen from the manifest and the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DetectedState {
    NoRecord,
    Current(ProxyRecord),
    Stale(ProxyRecord),
    Inconsistent {
        previous: Option<ProxyRecord>,
        proxy: Address,
        implementation: Address,
    },
}

/// Validated inputs of a proxy transition.
struct Prepared<Cl> {
    client: Cl,
    artifact: DeployableArtifact,
    creation_code: Bytes,
    init_data: Bytes,
}

fn argument_error(e: ArgumentError) -> ErrorKind {
    match e {
        ArgumentError::Arity { expected, actual } => {
            ErrorKind::InitializerArityMismatch { expected, actual }
        }
        ArgumentError::Type {
            index,
            expected,
            reason,
        } => ErrorKind::InitializerTypeMismatch {
            index,
            expected,
            reason,
        },
        ArgumentError::Encoding(reason) => ErrorKind::InitializerTypeMismatch {
            index: 0,
            expected: "abi-encodable value".to_string(),
            reason,
        },
    }
}

fn incomplete(observed: &ObservedAddresses, reason: impl fmt::Display) -> ErrorKind {
    ErrorKind::DeploymentIncomplete {
        observed: observed.clone(),
        reason: reason.to_string(),
    }
}

/// A stalled transaction stays pending; anything else leaves the transition half done.
fn not_included(observed: &ObservedAddresses, e: ChainError) -> ErrorKind {
    match e {
        ChainError::InclusionTimeout(tx_hash) => ErrorKind::InclusionTimeout {
            tx_hash,
            observed: ObservedAddresses {
                pending_transaction: Some(tx_hash),
                ..observed.clone()
            },
        },
        e => incomplete(observed, e),
    }
}

fn lease_error(e: ManifestError) -> ErrorKind {
    match e {
        ManifestError::InProgress { .. } => ErrorKind::ReconciliationInProgress,
        e => ErrorKind::Manifest(e),
    }
}

/// Drives networks towards their desired deployment state.
pub struct Orchestrator<C: ChainConnector> {
    registry: NetworkRegistry,
    connector: C,
    store: ManifestStore,
    audit: AuditLog,
    retry: RetryPolicy,
    lock_mode: LockMode,
}

impl<C: ChainConnector> Orchestrator<C> {
    pub fn new(registry: NetworkRegistry, connector: C, store: ManifestStore) -> Self {
        Self {
            registry,
            connector,
            store,
            audit: AuditLog::default(),
            retry: RetryPolicy::default(),
            lock_mode: LockMode::default(),
        }
    }

    pub fn audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Bring `request.network` to `request.desired_version` and return the resulting record.
    pub async fn reconcile(&self, request: ReconcileRequest) -> Result<ProxyRecord, Error> {
        self.reconcile_with(&request, &Cancellation::never())
            .await
            .map(|(_, record)| record)
    }

    /// [`Self::reconcile`] with cancellation, also reporting which transition ran.
    pub async fn reconcile_with(
        &self,
        request: &ReconcileRequest,
        cancel: &Cancellation,
    ) -> Result<(Action, ProxyRecord), Error> {
        self.run_reconcile(request, cancel)
            .await
            .map_err(|kind| Error::new(&request.network, &request.logical_name, kind))
    }

    /// Reconcile many requests concurrently. One failure never stops the others.
    pub async fn reconcile_all(
        &self,
        requests: Vec<ReconcileRequest>,
        cancel: &Cancellation,
    ) -> Vec<BatchOutcome> {
        let results = join_all(requests.iter().map(|r| self.reconcile_with(r, cancel))).await;
        requests
            .into_iter()
            .zip(results)
            .map(|(request, result)| BatchOutcome { request, result })
            .collect()
    }

    async fn connect(&self, network: &str) -> Result<C::Client, ErrorKind> {
        let descriptor = self
            .registry
            .get(network)
            .ok_or(ErrorKind::UnknownNetwork)?;
        self.connector
            .connect(descriptor)
            .await
            .map_err(ErrorKind::Chain)
    }

    /// Connect to `network` and resolve the artifact of `logical_name` at `version`.
    async fn resolve(
        &self,
        network: &str,
        logical_name: &str,
        version: u64,
    ) -> Result<(C::Client, DeployableArtifact), ErrorKind> {
        let client = self.connect(network).await?;
        let artifact = client
            .resolve_factory(logical_name, version)
            .map_err(|e| ErrorKind::UnresolvableImplementation {
                version,
                reason: e.to_string(),
            })?;
        Ok((client, artifact))
    }

    async fn lease(&self, key: &RecordKey) -> Result<KeyLease, ErrorKind> {
        self.store
            .acquire(key, self.lock_mode)
            .await
            .map_err(lease_error)
    }

    async fn run_reconcile(
        &self,
        request: &ReconcileRequest,
        cancel: &Cancellation,
    ) -> Result<(Action, ProxyRecord), ErrorKind> {
        let (client, artifact) = self
            .resolve(
                &request.network,
                &request.logical_name,
                request.desired_version,
            )
            .await?;

        let key = RecordKey::new(&request.network, &request.logical_name);
        let _lease = self.lease(&key).await?;

        let current = self
            .store
            .get(&request.network, &request.logical_name)
            .map_err(ErrorKind::Manifest)?;

        if let Some(record) = current.clone().filter(|r| r.kind == DeploymentKind::Direct) {
            let record = self
                .check_direct(&client, record, request.desired_version)
                .await?;
            return Ok((Action::Unchanged, record));
        }

        // Upgradeable implementations are initialized through the proxy, never constructed with arguments.
        let creation_code = artifact.creation_code(&[]).map_err(argument_error)?;
        let init_data = artifact
            .encode_initializer(&request.initializer_params)
            .map_err(argument_error)?;
        let prepared = Prepared {
            client,
            artifact,
            creation_code,
            init_data,
        };

        let state = self.detect(&prepared.client, current, request).await?;
        tracing::info!(
            network = %request.network,
            contract = %request.logical_name,
            desired_version = request.desired_version,
            state = ?state,
            "Detected deployment state"
        );

        match state {
            DetectedState::Current(record) => Ok((Action::Unchanged, record)),
            DetectedState::NoRecord => {
                ensure_not_cancelled(cancel)?;
                let record = self.fresh_deploy(request, &prepared).await?;
                Ok((Action::FreshDeploy, record))
            }
            DetectedState::Stale(record) => {
                ensure_not_cancelled(cancel)?;
                let record = self.upgrade(request, &prepared, record).await?;
                Ok((Action::Upgrade, record))
            }
            DetectedState::Inconsistent {
                previous,
                proxy,
                implementation,
            } => {
                ensure_not_cancelled(cancel)?;
                let version = self
                    .identify_version(&prepared.client, request, proxy, implementation)
                    .await?;
                let record = self
                    .import(request, previous.as_ref(), proxy, implementation, version)
                    .await?;
                Ok((Action::ForceImport, record))
            }
        }
    }

    async fn read_implementation(
        &self,
        client: &C::Client,
        proxy: Address,
    ) -> Result<Option<Address>, ChainError> {
        self.retry
            .read("implementation slot", move || client.implementation_of(proxy))
            .await
    }

    /// Find the artifact version whose runtime code is deployed at `implementation`.
    ///
    /// Versions are tried from the desired one downwards, then upwards until an
    /// artifact no longer resolves.
    async fn identify_version(
        &self,
        client: &C::Client,
        request: &ReconcileRequest,
        proxy: Address,
        implementation: Address,
    ) -> Result<u64, ErrorKind> {
        let code = self
            .retry
            .read("implementation code", move || client.code_at(implementation))
            .await
            .map_err(ErrorKind::Chain)?;

        let name = &request.logical_name;
        let desired = request.desired_version;
        let older = (1..=desired)
            .rev()
            .filter_map(|version| client.resolve_factory(name, version).ok());
        let newer = (desired.saturating_add(1)..)
            .map_while(|version| client.resolve_factory(name, version).ok());
        for artifact in older.chain(newer) {
            if artifact.matches_runtime_code(&code) {
                tracing::info!(
                    network = %request.network,
                    implementation = %implementation,
                    version = artifact.version,
                    "Identified implementation version from on-chain code"
                );
                return Ok(artifact.version);
            }
        }

        tracing::warn!(
            network = %request.network,
            proxy = %proxy,
            implementation = %implementation,
            "On-chain implementation matches no artifact version"
        );
        Err(ErrorKind::UnidentifiedImplementation {
            proxy,
            implementation,
        })
    }

    /// A direct deployment can only be current; anything else is refused.
    async fn check_direct(
        &self,
        client: &C::Client,
        record: ProxyRecord,
        desired_version: u64,
    ) -> Result<ProxyRecord, ErrorKind> {
        let address = record.proxy_address;
        let present = self
            .retry
            .read("contract code", move || client.has_code(address))
            .await
            .map_err(ErrorKind::Chain)?;
        if !present {
            return Err(ErrorKind::ProxyNotFound { address });
        }
        match record.abi_version.cmp(&desired_version) {
            Ordering::Equal => Ok(record),
            Ordering::Less => Err(ErrorKind::NotUpgradeable { address }),
            Ordering::Greater => Err(ErrorKind::VersionRegression {
                current: record.abi_version,
                desired: desired_version,
            }),
        }
    }

    async fn detect(
        &self,
        client: &C::Client,
        current: Option<ProxyRecord>,
        request: &ReconcileRequest,
    ) -> Result<DetectedState, ErrorKind> {
        let Some(record) = current else {
            let Some(proxy) = request.known_proxy else {
                return Ok(DetectedState::NoRecord);
            };
            let implementation = self
                .read_implementation(client, proxy)
                .await
                .map_err(ErrorKind::Chain)?
                .ok_or(ErrorKind::ProxyNotFound { address: proxy })?;
            return Ok(DetectedState::Inconsistent {
                previous: None,
                proxy,
                implementation,
            });
        };

        let on_chain = self
            .read_implementation(client, record.proxy_address)
            .await
            .map_err(ErrorKind::Chain)?;

        match on_chain {
            Some(implementation) if implementation == record.implementation_address => {
                match record.abi_version.cmp(&request.desired_version) {
                    Ordering::Equal => Ok(DetectedState::Current(record)),
                    Ordering::Less => Ok(DetectedState::Stale(record)),
                    Ordering::Greater => Err(ErrorKind::VersionRegression {
                        current: record.abi_version,
                        desired: request.desired_version,
                    }),
                }
            }
            Some(implementation) => {
                tracing::warn!(
                    network = %record.network,
                    proxy = %record.proxy_address,
                    recorded = %record.implementation_address,
                    on_chain = %implementation,
                    "Proxy implementation differs from manifest"
                );
                Ok(DetectedState::Inconsistent {
                    proxy: record.proxy_address,
                    implementation,
                    previous: Some(record),
                })
            }
            None => {
                let recorded = record.proxy_address;
                let Some(proxy) = request.known_proxy.filter(|p| *p != recorded) else {
                    return Err(ErrorKind::ProxyNotFound { address: recorded });
                };
                let implementation = self
                    .read_implementation(client, proxy)
                    .await
                    .map_err(ErrorKind::Chain)?
                    .ok_or(ErrorKind::ProxyNotFound { address: proxy })?;
                Ok(DetectedState::Inconsistent {
                    previous: Some(record),
                    proxy,
                    implementation,
                })
            }
        }
    }

    fn finish<T>(&self, mut audit: AuditRecord, result: &Result<T, ErrorKind>) {
        audit.outcome = match result {
            Ok(_) => Outcome::Succeeded,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.audit.emit(&audit);
    }

    async fn fresh_deploy(
        &self,
        request: &ReconcileRequest,
        prepared: &Prepared<C::Client>,
    ) -> Result<ProxyRecord, ErrorKind> {
        let mut audit = AuditRecord::new(
            &request.network,
            &request.logical_name,
            TransitionKind::FreshDeploy,
        );
        let result = self.run_fresh_deploy(request, prepared, &mut audit).await;
        self.finish(audit, &result);
        result
    }

    async fn run_fresh_deploy(
        &self,
        request: &ReconcileRequest,
        prepared: &Prepared<C::Client>,
        audit: &mut AuditRecord,
    ) -> Result<ProxyRecord, ErrorKind> {
        let client = &prepared.client;
        let mut observed = ObservedAddresses::default();

        tracing::info!(network = %request.network, contract = %request.logical_name, "Deploying implementation...");
        let tx = client
            .deploy(prepared.creation_code.clone())
            .await
            .map_err(ErrorKind::Chain)?;
        observed.pending_transaction = Some(tx);
        audit.transaction_hash = Some(tx);

        let implementation = self
            .retry
            .await_receipt(client, tx)
            .await
            .and_then(|r| r.created_address())
            .map_err(|e| not_included(&observed, e))?;
        observed.implementation = Some(implementation);
        observed.pending_transaction = None;
        audit.new_implementation = Some(implementation);

        tracing::info!(network = %request.network, implementation = %implementation, "Deploying proxy...");
        let tx = client
            .deploy_proxy(implementation, prepared.init_data.clone())
            .await
            .map_err(|e| incomplete(&observed, e))?;
        observed.pending_transaction = Some(tx);
        audit.transaction_hash = Some(tx);

        let proxy = self
            .retry
            .await_receipt(client, tx)
            .await
            .and_then(|r| r.created_address())
            .map_err(|e| not_included(&observed, e))?;
        observed.proxy = Some(proxy);
        observed.pending_transaction = None;
        audit.proxy = Some(proxy);

        let resolved = self
            .read_implementation(client, proxy)
            .await
            .map_err(|e| incomplete(&observed, e))?;
        if resolved != Some(implementation) {
            return Err(incomplete(
                &observed,
                format!("new proxy resolves to {resolved:?} instead of {implementation}"),
            ));
        }

        let record = ProxyRecord {
            network: request.network.clone(),
            logical_name: request.logical_name.clone(),
            proxy_address: proxy,
            implementation_address: implementation,
            abi_version: prepared.artifact.version,
            last_transaction_hash: Some(tx),
            kind: DeploymentKind::Proxy,
            origin: RecordOrigin::Deployed,
            updated_at: unix_now(),
        };
        self.store
            .put(record.clone())
            .await
            .map_err(|e| incomplete(&observed, format!("manifest write failed: {e}")))?;

        Ok(record)
    }

    async fn upgrade(
        &self,
        request: &ReconcileRequest,
        prepared: &Prepared<C::Client>,
        current: ProxyRecord,
    ) -> Result<ProxyRecord, ErrorKind> {
        let mut audit = AuditRecord::new(
            &request.network,
            &request.logical_name,
            TransitionKind::Upgrade,
        );
        audit.proxy = Some(current.proxy_address);
        audit.old_implementation = Some(current.implementation_address);

        let result = self.run_upgrade(request, prepared, current, &mut audit).await;
        self.finish(audit, &result);
        result
    }

    async fn run_upgrade(
        &self,
        request: &ReconcileRequest,
        prepared: &Prepared<C::Client>,
        current: ProxyRecord,
        audit: &mut AuditRecord,
    ) -> Result<ProxyRecord, ErrorKind> {
        let client = &prepared.client;
        let proxy = current.proxy_address;
        let mut observed = ObservedAddresses {
            proxy: Some(proxy),
            ..Default::default()
        };

        tracing::info!(
            network = %request.network,
            proxy = %proxy,
            from_version = current.abi_version,
            to_version = prepared.artifact.version,
            "Deploying new implementation..."
        );
        let tx = client
            .deploy(prepared.creation_code.clone())
            .await
            .map_err(ErrorKind::Chain)?;
        observed.pending_transaction = Some(tx);
        audit.transaction_hash = Some(tx);

        let implementation = self
            .retry
            .await_receipt(client, tx)
            .await
            .and_then(|r| r.created_address())
            .map_err(|e| not_included(&observed, e))?;
        observed.implementation = Some(implementation);
        observed.pending_transaction = None;
        audit.new_implementation = Some(implementation);

        tracing::info!(network = %request.network, proxy = %proxy, implementation = %implementation, "Upgrading proxy...");
        let tx = client
            .upgrade_proxy(proxy, implementation)
            .await
            .map_err(|e| incomplete(&observed, e))?;
        observed.pending_transaction = Some(tx);
        audit.transaction_hash = Some(tx);

        // A reverted upgrade shows up as a mismatch below.
        self.retry
            .await_receipt(client, tx)
            .await
            .map_err(|e| not_included(&observed, e))?;
        observed.pending_transaction = None;

        let actual = self
            .read_implementation(client, proxy)
            .await
            .map_err(|e| incomplete(&observed, format!("could not verify upgrade: {e}")))?;
        if actual != Some(implementation) {
            return Err(ErrorKind::UpgradeVerificationFailed {
                proxy,
                expected: implementation,
                actual,
                observed,
            });
        }

        let record = ProxyRecord {
            implementation_address: implementation,
            abi_version: prepared.artifact.version,
            last_transaction_hash: Some(tx),
            origin: RecordOrigin::Upgraded,
            updated_at: unix_now(),
            ..current
        };
        self.store
            .put(record.clone())
            .await
            .map_err(|e| incomplete(&observed, format!("manifest write failed: {e}")))?;

        Ok(record)
    }

    /// Rebuild the record from on-chain truth. Never submits a transaction.
    async fn import(
        &self,
        request: &ReconcileRequest,
        previous: Option<&ProxyRecord>,
        proxy: Address,
        implementation: Address,
        version: u64,
    ) -> Result<ProxyRecord, ErrorKind> {
        let mut audit = AuditRecord::new(
            &request.network,
            &request.logical_name,
            TransitionKind::ForceImport,
        );
        audit.proxy = Some(proxy);
        audit.old_implementation = previous.map(|r| r.implementation_address);
        audit.new_implementation = Some(implementation);

        let record = ProxyRecord {
            network: request.network.clone(),
            logical_name: request.logical_name.clone(),
            proxy_address: proxy,
            implementation_address: implementation,
            abi_version: version,
            last_transaction_hash: None,
            kind: DeploymentKind::Proxy,
            origin: RecordOrigin::Imported,
            updated_at: unix_now(),
        };
        let result = self
            .store
            .put(record.clone())
            .await
            .map(|_| record)
            .map_err(ErrorKind::Manifest);

        self.finish(audit, &result);
        result
    }

    /// Adopt an existing proxy into the manifest, replacing whatever is recorded.
    ///
    /// `version` is the implementation version the operator asserts is deployed
    /// behind the proxy; it must resolve to an artifact.
    pub async fn force_import(
        &self,
        network: &str,
        logical_name: &str,
        proxy: Address,
        version: u64,
    ) -> Result<ProxyRecord, Error> {
        let request = ReconcileRequest::new(network, logical_name, version).known_proxy(proxy);
        self.run_force_import(&request, proxy)
            .await
            .map_err(|kind| Error::new(network, logical_name, kind))
    }

    async fn run_force_import(
        &self,
        request: &ReconcileRequest,
        proxy: Address,
    ) -> Result<ProxyRecord, ErrorKind> {
        let (client, artifact) = self
            .resolve(
                &request.network,
                &request.logical_name,
                request.desired_version,
            )
            .await?;

        let _lease = self
            .lease(&RecordKey::new(&request.network, &request.logical_name))
            .await?;
        let previous = self
            .store
            .get(&request.network, &request.logical_name)
            .map_err(ErrorKind::Manifest)?;

        let implementation = self
            .read_implementation(&client, proxy)
            .await
            .map_err(ErrorKind::Chain)?
            .ok_or(ErrorKind::ProxyNotFound { address: proxy })?;

        tracing::info!(
            network = %request.network,
            contract = %request.logical_name,
            proxy = %proxy,
            implementation = %implementation,
            "Importing proxy from chain"
        );
        self.import(
            request,
            previous.as_ref(),
            proxy,
            implementation,
            artifact.version,
        )
        .await
    }

    /// Deploy a non-upgradeable contract with constructor arguments.
    ///
    /// Idempotent: an existing direct deployment at the same version is returned as is.
    pub async fn deploy_direct(
        &self,
        network: &str,
        logical_name: &str,
        version: u64,
        constructor_args: &[String],
        cancel: &Cancellation,
    ) -> Result<(Action, ProxyRecord), Error> {
        self.run_deploy_direct(network, logical_name, version, constructor_args, cancel)
            .await
            .map_err(|kind| Error::new(network, logical_name, kind))
    }

    async fn run_deploy_direct(
        &self,
        network_name: &str,
        logical_name: &str,
        version: u64,
        constructor_args: &[String],
        cancel: &Cancellation,
    ) -> Result<(Action, ProxyRecord), ErrorKind> {
        let (client, artifact) = self.resolve(network_name, logical_name, version).await?;
        let creation_code = artifact
            .creation_code(constructor_args)
            .map_err(argument_error)?;

        let _lease = self
            .lease(&RecordKey::new(network_name, logical_name))
            .await?;

        if let Some(record) = self
            .store
            .get(network_name, logical_name)
            .map_err(ErrorKind::Manifest)?
        {
            if record.kind != DeploymentKind::Direct {
                return Err(ErrorKind::KindConflict {
                    existing: record.kind,
                });
            }
            let record = self.check_direct(&client, record, version).await?;
            return Ok((Action::Unchanged, record));
        }

        ensure_not_cancelled(cancel)?;

        let mut audit = AuditRecord::new(network_name, logical_name, TransitionKind::DirectDeploy);
        let record = ProxyRecord {
            network: network_name.to_string(),
            logical_name: logical_name.to_string(),
            proxy_address: Address::ZERO,
            implementation_address: Address::ZERO,
            abi_version: version,
            last_transaction_hash: None,
            kind: DeploymentKind::Direct,
            origin: RecordOrigin::Deployed,
            updated_at: 0,
        };
        let result = self
            .run_direct_deploy(&client, creation_code, record, &mut audit)
            .await;
        self.finish(audit, &result);
        result.map(|record| (Action::DirectDeploy, record))
    }

    async fn run_direct_deploy(
        &self,
        client: &C::Client,
        creation_code: Bytes,
        mut record: ProxyRecord,
        audit: &mut AuditRecord,
    ) -> Result<ProxyRecord, ErrorKind> {
        let mut observed = ObservedAddresses::default();

        tracing::info!(network = %record.network, contract = %record.logical_name, "Deploying contract...");
        let tx = client.deploy(creation_code).await.map_err(ErrorKind::Chain)?;
        observed.pending_transaction = Some(tx);
        audit.transaction_hash = Some(tx);

        let address = self
            .retry
            .await_receipt(client, tx)
            .await
            .and_then(|r| r.created_address())
            .map_err(|e| not_included(&observed, e))?;
        observed.implementation = Some(address);
        observed.proxy = Some(address);
        observed.pending_transaction = None;
        audit.proxy = Some(address);
        audit.new_implementation = Some(address);

        let present = self
            .retry
            .read("contract code", move || client.has_code(address))
            .await
            .map_err(|e| incomplete(&observed, e))?;
        if !present {
            return Err(incomplete(&observed, format!("no code at {address} after deployment")));
        }

        record.proxy_address = address;
        record.implementation_address = address;
        record.last_transaction_hash = Some(tx);
        record.updated_at = unix_now();
        self.store
            .put(record.clone())
            .await
            .map_err(|e| incomplete(&observed, format!("manifest write failed: {e}")))?;

        Ok(record)
    }
}

impl<C: ChainConnector> Orchestrator<C> {
    /// Register `route` on the recorded deployment of `logical_name`.
    pub async fn register_route(
        &self,
        network: &str,
        logical_name: &str,
        route: &RouteEntry,
    ) -> Result<RouteStatus, Error> {
        let client = self.connect(network).await.map_err(|kind| {
            let kind = match kind {
                ErrorKind::Chain(e) => ErrorKind::RouteRegistrationFailed(e),
                kind => kind,
            };
            Error::new(network, logical_name, kind)
        })?;

        let _lease = self
            .lease(&RecordKey::new(network, logical_name))
            .await
            .map_err(|kind| Error::new(network, logical_name, kind))?;
        let record = self
            .store
            .get(network, logical_name)
            .map_err(|e| Error::new(network, logical_name, ErrorKind::Manifest(e)))?
            .ok_or_else(|| Error::new(network, logical_name, ErrorKind::NoRecord))?;

        RouteRegistrar::new(&client, &self.retry, &self.audit)
            .register(&record, route)
            .await
    }
}

fn ensure_not_cancelled(cancel: &Cancellation) -> Result<(), ErrorKind> {
    if cancel.is_cancelled() {
        return Err(ErrorKind::Cancelled);
    }
    Ok(())
}
