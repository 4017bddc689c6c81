//! Cross-chain route registration against a deployed port contract.
//!
//! The port contract exposes:
//! - `chainKeyOf(string chainId) returns (address)`: current registration, zero if none;
//! - `isValidChainKey(address key) returns (bool)`: validation precondition;
//! - `registerRoute(string chainId, address key)`: the mutation.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, B256},
};
use serde::{Deserialize, Serialize};

use crate::{
    audit::{AuditLog, AuditRecord, Outcome, TransitionKind},
    chain::{ChainClient, ChainError, decode_return, encode_call},
    error::{Error, ErrorKind, ObservedAddresses},
    manifest::ProxyRecord,
    retry::RetryPolicy,
};

const CHAIN_KEY_OF: &str = "function chainKeyOf(string chainId) returns (address)";
const IS_VALID_CHAIN_KEY: &str = "function isValidChainKey(address key) returns (bool)";
const REGISTER_ROUTE: &str = "function registerRoute(string chainId, address key)";

/// A counterparty chain and the chain-key address authorized for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    pub chain_id: String,
    pub chain_key: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RouteStatus {
    Registered { transaction_hash: B256 },
    AlreadyRegistered,
}

/// Registers [`RouteEntry`]s on one network.
#[derive(Debug)]
pub struct RouteRegistrar<'a, C> {
    client: &'a C,
    retry: &'a RetryPolicy,
    audit: &'a AuditLog,
}

impl<'a, C: ChainClient> RouteRegistrar<'a, C> {
    pub fn new(client: &'a C, retry: &'a RetryPolicy, audit: &'a AuditLog) -> Self {
        Self {
            client,
            retry,
            audit,
        }
    }

    /// Register `route` on the contract behind `record`, unless it already is.
    pub async fn register(&self, record: &ProxyRecord, route: &RouteEntry) -> Result<RouteStatus, Error> {
        self.run(record, route)
            .await
            .map_err(|kind| Error::new(&record.network, &record.logical_name, kind))
    }

    async fn registered_key(&self, contract: Address, chain_id: &str) -> Result<Option<Address>, ChainError> {
        let calldata = encode_call(CHAIN_KEY_OF, &[DynSolValue::String(chain_id.to_string())])?;
        let client = self.client;
        let output = self
            .retry
            .read("chainKeyOf", move || client.call(contract, calldata.clone()))
            .await?;
        match decode_return(&DynSolType::Address, &output)? {
            DynSolValue::Address(a) if a != Address::ZERO => Ok(Some(a)),
            _ => Ok(None),
        }
    }

    async fn is_valid_key(&self, contract: Address, key: Address) -> Result<bool, ChainError> {
        let calldata = encode_call(IS_VALID_CHAIN_KEY, &[DynSolValue::Address(key)])?;
        let client = self.client;
        let output = self
            .retry
            .read("isValidChainKey", move || client.call(contract, calldata.clone()))
            .await?;
        match decode_return(&DynSolType::Bool, &output)? {
            DynSolValue::Bool(valid) => Ok(valid),
            other => Err(ChainError::Decode(format!("isValidChainKey returned {other:?}"))),
        }
    }

    async fn run(&self, record: &ProxyRecord, route: &RouteEntry) -> Result<RouteStatus, ErrorKind> {
        let contract = record.proxy_address;

        let current = self
            .registered_key(contract, &route.chain_id)
            .await
            .map_err(ErrorKind::RouteRegistrationFailed)?;
        if current == Some(route.chain_key) {
            tracing::info!(
                network = %record.network,
                chain_id = %route.chain_id,
                chain_key = %route.chain_key,
                "Route already registered"
            );
            return Ok(RouteStatus::AlreadyRegistered);
        }

        let valid = self
            .is_valid_key(contract, route.chain_key)
            .await
            .map_err(ErrorKind::RouteRegistrationFailed)?;
        if !valid {
            return Err(ErrorKind::InvalidChainKey {
                chain_key: route.chain_key,
            });
        }

        let mut audit = AuditRecord::new(
            &record.network,
            &record.logical_name,
            TransitionKind::RouteRegistration,
        );
        audit.proxy = Some(contract);
        audit.old_implementation = Some(record.implementation_address);
        audit.new_implementation = Some(record.implementation_address);

        let result = self.submit(contract, route, &mut audit).await;
        audit.outcome = match &result {
            Ok(_) => Outcome::Succeeded,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.audit.emit(&audit);
        result
    }

    async fn submit(
        &self,
        contract: Address,
        route: &RouteEntry,
        audit: &mut AuditRecord,
    ) -> Result<RouteStatus, ErrorKind> {
        let calldata = encode_call(
            REGISTER_ROUTE,
            &[
                DynSolValue::String(route.chain_id.clone()),
                DynSolValue::Address(route.chain_key),
            ],
        )
        .map_err(ErrorKind::RouteRegistrationFailed)?;

        tracing::info!(
            contract = %contract,
            chain_id = %route.chain_id,
            chain_key = %route.chain_key,
            "Registering route..."
        );
        let tx = self
            .client
            .send(contract, calldata)
            .await
            .map_err(ErrorKind::RouteRegistrationFailed)?;
        audit.transaction_hash = Some(tx);

        let receipt = self.retry.await_receipt(self.client, tx).await.map_err(|e| match e {
            ChainError::InclusionTimeout(tx_hash) => ErrorKind::InclusionTimeout {
                tx_hash,
                observed: ObservedAddresses {
                    proxy: Some(contract),
                    pending_transaction: Some(tx_hash),
                    ..Default::default()
                },
            },
            e => ErrorKind::RouteRegistrationFailed(e),
        })?;
        if !receipt.success {
            return Err(ErrorKind::RouteRegistrationFailed(ChainError::Reverted(tx)));
        }

        let registered = self
            .registered_key(contract, &route.chain_id)
            .await
            .map_err(ErrorKind::RouteRegistrationFailed)?;
        if registered != Some(route.chain_key) {
            return Err(ErrorKind::RouteRegistrationFailed(ChainError::Decode(format!(
                "chainKeyOf({}) reports {registered:?} after registration",
                route.chain_id
            ))));
        }

        Ok(RouteStatus::Registered {
            transaction_hash: tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_entry_from_toml() {
        let entry: RouteEntry = toml::from_str(
            r#"
            chain_id = "Bitcoin"
            chain_key = "0x45584a4f8ee6b7ac2fd9c9ebb2bdb0b9d4c8207e"
            "#,
        )
        .unwrap();
        assert_eq!(entry.chain_id, "Bitcoin");
        assert_eq!(
            entry.chain_key,
            "0x45584a4f8ee6b7ac2fd9c9ebb2bdb0b9d4c8207e"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn test_port_contract_selectors_encode() {
        let calldata = encode_call(
            REGISTER_ROUTE,
            &[
                DynSolValue::String("Bitcoin".into()),
                DynSolValue::Address(Address::repeat_byte(7)),
            ],
        )
        .unwrap();
        // selector + address word + offset word + length word + one data word
        assert_eq!(calldata.len(), 4 + 32 * 4);
    }
}
