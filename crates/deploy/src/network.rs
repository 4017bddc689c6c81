//! Network registry: the static catalog of networks a run may target.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Reference to the deployer key of a network.
///
/// Only the reference is ever stored or printed. The key material is read when a
/// chain client is created and stays inside the [`PrivateKeySigner`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerCredential {
    /// Name of an environment variable holding a hex private key.
    Env(String),
    /// Path to a file holding a hex private key.
    File(PathBuf),
}

impl fmt::Debug for SignerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(var) => write!(f, "env:{var}"),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl fmt::Display for SignerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SignerCredential {
    /// Resolve the reference into a signer.
    pub fn resolve(&self) -> Result<PrivateKeySigner> {
        let raw = match self {
            Self::Env(var) => std::env::var(var)
                .with_context(|| format!("Signer environment variable {var} is not set"))?,
            Self::File(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read signer key file {}", path.display()))?,
        };

        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
            .with_context(|| format!("Signer {self} is not hex encoded"))?;
        PrivateKeySigner::from_slice(&bytes)
            .with_context(|| format!("Signer {self} does not hold a valid private key"))
    }

    /// Address of the resolved signer.
    pub fn address(&self) -> Result<Address> {
        Ok(self.resolve()?.address())
    }
}

/// Connection parameters for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// Unique registry key, e.g. `bevm` or `sepolia`.
    pub name: String,
    pub rpc_endpoint: Url,
    #[serde(rename = "signer")]
    pub signer_credential: SignerCredential,
    /// Expected `eth_chainId`. Checked before the first mutating submission when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

/// Name-keyed catalog of [`NetworkDescriptor`]s, immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: BTreeMap<String, NetworkDescriptor>,
}

impl NetworkRegistry {
    /// Build a registry, rejecting duplicate names.
    pub fn new(entries: impl IntoIterator<Item = NetworkDescriptor>) -> Result<Self> {
        let mut networks = BTreeMap::new();
        for entry in entries {
            if entry.name.is_empty() {
                anyhow::bail!("Network entry with rpc endpoint {} has an empty name", entry.rpc_endpoint);
            }
            let name = entry.name.clone();
            if networks.insert(name.clone(), entry).is_some() {
                anyhow::bail!("Network {name} is declared more than once");
            }
        }
        Ok(Self { networks })
    }

    pub fn get(&self, name: &str) -> Option<&NetworkDescriptor> {
        self.networks.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkDescriptor> {
        self.networks.values()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Anvil's first dev account.
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn descriptor(name: &str) -> NetworkDescriptor {
        NetworkDescriptor {
            name: name.to_string(),
            rpc_endpoint: Url::parse("http://localhost:8545").unwrap(),
            signer_credential: SignerCredential::Env(format!("{}_KEY", name.to_uppercase())),
            chain_id: None,
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = NetworkRegistry::new([descriptor("bevm"), descriptor("bevm")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup() {
        let registry = NetworkRegistry::new([descriptor("bevm"), descriptor("sepolia")]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("bevm").is_some());
        assert!(registry.get("bitlayer").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["bevm", "sepolia"]);
    }

    #[test]
    fn test_credential_debug_never_shows_key() {
        let temp_dir = tempdir::TempDir::new("portsmith-test").unwrap();
        let key_path = temp_dir.path().join("key");
        std::fs::write(&key_path, format!("0x{DEV_KEY}\n")).unwrap();

        let credential = SignerCredential::File(key_path);
        let debug = format!("{credential:?}");
        assert!(!debug.contains(DEV_KEY));

        let address = credential.address().unwrap();
        assert_eq!(
            address.to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_env_credential_resolves_generated_key() {
        use rand::Rng;

        let secret: [u8; 32] = rand::rng().random();
        let var = "PORTSMITH_TEST_GENERATED_KEY";
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var(var, hex::encode(secret)) };

        let credential = SignerCredential::Env(var.to_string());
        let expected = PrivateKeySigner::from_slice(&secret).unwrap().address();
        assert_eq!(credential.address().unwrap(), expected);
        assert_eq!(credential.to_string(), format!("env:{var}"));
    }

    #[test]
    fn test_missing_env_credential_errors() {
        let credential = SignerCredential::Env("PORTSMITH_TEST_SURELY_UNSET_KEY".to_string());
        assert!(credential.resolve().is_err());
    }

    #[test]
    fn test_descriptor_toml_shape() {
        let descriptor: NetworkDescriptor = toml::from_str(
            r#"
            name = "bevm"
            rpc_endpoint = "https://rpc-mainnet-1.bevm.io"
            signer = { env = "BEVM_DEPLOYER_KEY" }
            chain_id = 11501
            "#,
        )
        .unwrap();
        assert_eq!(descriptor.name, "bevm");
        assert_eq!(
            descriptor.signer_credential,
            SignerCredential::Env("BEVM_DEPLOYER_KEY".to_string())
        );
        assert_eq!(descriptor.chain_id, Some(11501));
    }
}
