//! Compiled contract artifacts and initializer/constructor argument encoding.

use std::path::{Path, PathBuf};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::{JsonAbi, Param},
    primitives::Bytes,
};
use serde::Deserialize;

/// Name of the function a proxy runs once, in its constructor, on fresh deployment.
pub const INITIALIZER: &str = "initialize";

/// Errors produced while validating arguments against an ABI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("expected {expected} argument(s), got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("argument {index} is not a valid `{expected}`: {reason}")]
    Type {
        index: usize,
        expected: String,
        reason: String,
    },
    #[error("failed to encode arguments: {0}")]
    Encoding(String),
}

/// Subset of a Hardhat artifact file that deployment needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactFile {
    contract_name: String,
    abi: JsonAbi,
    bytecode: Bytes,
    #[serde(default)]
    deployed_bytecode: Bytes,
}

/// A compiled implementation that can be deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployableArtifact {
    pub logical_name: String,
    pub version: u64,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
    /// Runtime code, with immutable values left as zero words. Empty if unknown.
    pub deployed_bytecode: Bytes,
}

impl DeployableArtifact {
    /// Parse a Hardhat-format artifact (`{contractName, abi, bytecode}`).
    pub fn from_hardhat_json(version: u64, json: &str) -> Result<Self, serde_json::Error> {
        let file: ArtifactFile = serde_json::from_str(json)?;
        Ok(Self {
            logical_name: file.contract_name,
            version,
            abi: file.abi,
            bytecode: file.bytecode,
            deployed_bytecode: file.deployed_bytecode,
        })
    }

    /// Whether `code` read from chain is this artifact's runtime code.
    ///
    /// Words that are zero in the artifact hold immutables and may differ on chain.
    pub fn matches_runtime_code(&self, code: &[u8]) -> bool {
        let expected = self.deployed_bytecode.as_ref();
        if expected.is_empty() || expected.len() != code.len() {
            return false;
        }
        let placeholders = immutable_placeholders(expected);
        expected
            .iter()
            .zip(code)
            .zip(placeholders)
            .all(|((expected, actual), placeholder)| placeholder || expected == actual)
    }

    /// Number of arguments `initialize` declares; zero when there is no initializer.
    pub fn initializer_arity(&self) -> usize {
        self.abi
            .function(INITIALIZER)
            .and_then(|overloads| overloads.first())
            .map(|f| f.inputs.len())
            .unwrap_or(0)
    }

    /// Validate `params` against `initialize` and produce its calldata.
    ///
    /// Returns empty calldata when the implementation has no initializer and no
    /// parameters were given.
    pub fn encode_initializer(&self, params: &[String]) -> Result<Bytes, ArgumentError> {
        let Some(function) = self
            .abi
            .function(INITIALIZER)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == params.len()))
        else {
            let expected = self.initializer_arity();
            if expected == 0 && params.is_empty() {
                return Ok(Bytes::new());
            }
            return Err(ArgumentError::Arity {
                expected,
                actual: params.len(),
            });
        };

        let values = coerce_params(&function.inputs, params)?;
        function
            .abi_encode_input(&values)
            .map(Bytes::from)
            .map_err(|e| ArgumentError::Encoding(e.to_string()))
    }

    /// Validate `params` against the constructor and produce the creation code.
    pub fn creation_code(&self, params: &[String]) -> Result<Bytes, ArgumentError> {
        let inputs: &[Param] = self
            .abi
            .constructor()
            .map(|c| c.inputs.as_slice())
            .unwrap_or_default();
        let values = coerce_params(inputs, params)?;
        self.creation_code_with(&values)
    }

    /// Creation code for already-typed constructor arguments.
    pub fn creation_code_with(&self, values: &[DynSolValue]) -> Result<Bytes, ArgumentError> {
        let mut code = self.bytecode.to_vec();
        match self.abi.constructor() {
            Some(constructor) => {
                let encoded = constructor
                    .abi_encode_input(values)
                    .map_err(|e| ArgumentError::Encoding(e.to_string()))?;
                code.extend_from_slice(&encoded);
            }
            None if values.is_empty() => {}
            None => {
                return Err(ArgumentError::Arity {
                    expected: 0,
                    actual: values.len(),
                });
            }
        }
        Ok(code.into())
    }
}

/// Marks bytes inside zero runs of at least one word.
fn immutable_placeholders(code: &[u8]) -> Vec<bool> {
    let mut mask = vec![false; code.len()];
    let mut start = 0;
    while start < code.len() {
        if code[start] != 0 {
            start += 1;
            continue;
        }
        let end = code[start..]
            .iter()
            .position(|b| *b != 0)
            .map_or(code.len(), |len| start + len);
        if end - start >= 32 {
            mask[start..end].fill(true);
        }
        start = end;
    }
    mask
}

/// Check arity, then coerce each string argument to its declared Solidity type.
fn coerce_params(inputs: &[Param], params: &[String]) -> Result<Vec<DynSolValue>, ArgumentError> {
    if inputs.len() != params.len() {
        return Err(ArgumentError::Arity {
            expected: inputs.len(),
            actual: params.len(),
        });
    }

    inputs
        .iter()
        .zip(params)
        .enumerate()
        .map(|(index, (input, raw))| {
            let ty: DynSolType = input.resolve().map_err(|e| ArgumentError::Type {
                index,
                expected: input.ty.clone(),
                reason: e.to_string(),
            })?;
            ty.coerce_str(raw).map_err(|e| ArgumentError::Type {
                index,
                expected: input.ty.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Directory of versioned Hardhat artifacts.
///
/// Implementations live at `<root>/<LogicalName>/v<version>.json`; the proxy used for
/// fresh deployments is a separate artifact file.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    proxy_artifact: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, proxy_artifact: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            proxy_artifact: proxy_artifact.into(),
        }
    }

    pub fn path_for(&self, logical_name: &str, version: u64) -> PathBuf {
        self.root.join(logical_name).join(format!("v{version}.json"))
    }

    /// Load the implementation artifact for `logical_name` at `version`.
    pub fn resolve(&self, logical_name: &str, version: u64) -> anyhow::Result<DeployableArtifact> {
        let path = self.path_for(logical_name, version);
        let mut artifact = Self::load(&path, version)?;
        // The directory name is the logical name the manifest is keyed by.
        artifact.logical_name = logical_name.to_string();
        Ok(artifact)
    }

    /// Load the ERC-1967 proxy artifact.
    pub fn proxy(&self) -> anyhow::Result<DeployableArtifact> {
        Self::load(&self.proxy_artifact, 0)
    }

    fn load(path: &Path, version: u64) -> anyhow::Result<DeployableArtifact> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        DeployableArtifact::from_hardhat_json(version, &content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))
    }
}
