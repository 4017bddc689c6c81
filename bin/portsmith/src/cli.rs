use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Args, Parser, Subcommand};
use portsmith_deploy::LockMode;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "portsmith")]
#[command(
    author,
    version,
    about = "Keep a proxied contract deployed and upgraded across many EVM networks"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "PORTSMITH_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file (or a directory containing `Portsmith.toml`).
    ///
    /// If not provided, `./Portsmith.toml` is used, then `<config dir>/portsmith/Portsmith.toml`.
    #[arg(short, long, global = true, alias = "conf", env = "PORTSMITH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured behavior when another run holds a contract.
    #[arg(long, global = true, env = "PORTSMITH_LOCK_MODE")]
    pub lock_mode: Option<LockMode>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring deployments to their desired version (fresh deploy, upgrade or re-import).
    Reconcile(ReconcileArgs),
    /// Adopt an existing proxy into the manifest, replacing the recorded state.
    Import(ImportArgs),
    /// Deploy a non-upgradeable contract with constructor arguments.
    DeployDirect(DeployDirectArgs),
    /// Register the configured cross-chain routes.
    Routes(RoutesArgs),
    /// Print the recorded deployments.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Only reconcile targets on this network.
    #[arg(short, long, env = "PORTSMITH_NETWORK")]
    pub network: Option<String>,

    /// Only reconcile targets for this contract.
    #[arg(long, env = "PORTSMITH_CONTRACT")]
    pub contract: Option<String>,

    /// Reconcile a single ad hoc target at this version instead of the configured targets.
    ///
    /// Requires `--network` and `--contract`.
    #[arg(long, requires_all = ["network", "contract"])]
    pub version: Option<u64>,

    /// Initializer argument of the ad hoc target. Repeat in declaration order.
    #[arg(long = "param", requires = "version")]
    pub params: Vec<String>,

    /// Address of an existing proxy to adopt when the manifest has no valid record.
    #[arg(long, requires = "version")]
    pub known_proxy: Option<Address>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(short, long, env = "PORTSMITH_NETWORK")]
    pub network: String,

    #[arg(long, env = "PORTSMITH_CONTRACT")]
    pub contract: String,

    /// Address of the proxy on chain.
    #[arg(long)]
    pub proxy: Address,

    /// Implementation version deployed behind the proxy.
    #[arg(long)]
    pub version: u64,
}

#[derive(Debug, Args)]
pub struct DeployDirectArgs {
    #[arg(short, long, env = "PORTSMITH_NETWORK")]
    pub network: String,

    #[arg(long, env = "PORTSMITH_CONTRACT")]
    pub contract: String,

    #[arg(long)]
    pub version: u64,

    /// Constructor argument. Repeat in declaration order.
    #[arg(long = "param")]
    pub params: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RoutesArgs {
    /// Only register routes on this network.
    #[arg(short, long, env = "PORTSMITH_NETWORK")]
    pub network: Option<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Only show records of this network.
    #[arg(short, long, env = "PORTSMITH_NETWORK")]
    pub network: Option<String>,

    /// Also show superseded records.
    #[arg(long)]
    pub history: bool,

    /// Print records as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}
