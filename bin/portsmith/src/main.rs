//! portsmith keeps one proxied contract deployed, upgraded and routed across many EVM networks.

mod cli;
mod report;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use portsmith_deploy::{
    Action, CancelHandle, Cancellation, Config, DEFAULT_CONFIG_FILENAME, DeploymentKind, LockMode,
    Orchestrator, ProxyRecord, ReconcileRequest, RpcConnector,
};

use cli::{Cli, Command, DeployDirectArgs, ImportArgs, ReconcileArgs, RoutesArgs, StatusArgs};
use report::{Detail, Row};

type Portsmith = Orchestrator<RpcConnector>;

/// `--config` if given, then `./Portsmith.toml`, then the user config directory.
fn config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    if Path::new(DEFAULT_CONFIG_FILENAME).exists() {
        return None;
    }
    dirs::config_dir()
        .map(|dir| dir.join("portsmith").join(DEFAULT_CONFIG_FILENAME))
        .filter(|path| path.exists())
}

fn orchestrator(config: &Config, lock_mode: Option<LockMode>) -> Result<Portsmith> {
    let connector =
        RpcConnector::new(config.artifact_store()).request_timeout(config.retry.request_timeout());
    Ok(Orchestrator::new(config.registry()?, connector, config.manifest_store()?)
        .audit_log(config.audit())
        .retry_policy(config.retry.clone())
        .lock_mode(lock_mode.unwrap_or(config.lock_mode)))
}

/// Cancel pending transitions on Ctrl-C. Transitions already submitting run to completion.
fn cancel_on_ctrl_c() -> Cancellation {
    let (handle, cancel) = Cancellation::new();
    tokio::spawn(watch_ctrl_c(handle));
    cancel
}

async fn watch_ctrl_c(handle: CancelHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupted, no new transitions will be started");
        handle.cancel();
    }
}

fn transition(
    network: &str,
    contract: &str,
    result: Result<(Action, ProxyRecord), portsmith_deploy::Error>,
) -> Row {
    Row {
        network: network.to_string(),
        contract: contract.to_string(),
        result: result.map(|(action, record)| Detail::Transition(action, record)),
    }
}

/// Print the rows and fail if any of them did.
fn finish(rows: Vec<Row>) -> Result<()> {
    if rows.is_empty() {
        tracing::warn!("Nothing to do");
        return Ok(());
    }
    println!("{}", report::outcomes(&rows));

    let failed = rows.iter().filter(|r| r.failed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} operations failed", rows.len());
    }
    Ok(())
}

async fn reconcile(portsmith: &Portsmith, config: &Config, args: ReconcileArgs) -> Result<()> {
    let cancel = cancel_on_ctrl_c();

    // Ad hoc target from the command line.
    if let (Some(version), Some(network), Some(contract)) = (args.version, &args.network, &args.contract) {
        let mut request = ReconcileRequest::new(network, contract, version).params(args.params);
        if let Some(proxy) = args.known_proxy {
            request = request.known_proxy(proxy);
        }
        let result = portsmith.reconcile_with(&request, &cancel).await;
        return finish(vec![transition(network, contract, result)]);
    }

    let (direct, proxied): (Vec<_>, Vec<_>) = config
        .targets_for(args.network.as_deref(), args.contract.as_deref())
        .partition(|t| t.kind == DeploymentKind::Direct);

    tracing::info!(
        proxied = proxied.len(),
        direct = direct.len(),
        "Reconciling configured targets"
    );

    let batch = portsmith.reconcile_all(proxied.iter().map(|t| t.request()).collect(), &cancel);
    let direct_results = join_all(direct.iter().map(|t| {
        portsmith.deploy_direct(&t.network, &t.contract, t.version, &t.params, &cancel)
    }));
    let (batch, direct_results) = tokio::join!(batch, direct_results);

    let mut rows: Vec<Row> = batch
        .into_iter()
        .map(|o| transition(&o.request.network, &o.request.logical_name, o.result))
        .collect();
    rows.extend(
        direct
            .iter()
            .zip(direct_results)
            .map(|(t, result)| transition(&t.network, &t.contract, result)),
    );
    finish(rows)
}

async fn import(portsmith: &Portsmith, args: ImportArgs) -> Result<()> {
    let result = portsmith
        .force_import(&args.network, &args.contract, args.proxy, args.version)
        .await
        .map(|record| (Action::ForceImport, record));
    finish(vec![transition(&args.network, &args.contract, result)])
}

async fn deploy_direct(portsmith: &Portsmith, args: DeployDirectArgs) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let result = portsmith
        .deploy_direct(&args.network, &args.contract, args.version, &args.params, &cancel)
        .await;
    finish(vec![transition(&args.network, &args.contract, result)])
}

async fn routes(portsmith: &Portsmith, config: &Config, args: RoutesArgs) -> Result<()> {
    let specs: Vec<_> = config.routes_for(args.network.as_deref()).collect();
    let entries: Vec<_> = specs.iter().map(|s| s.entry()).collect();

    let results = join_all(
        specs
            .iter()
            .zip(&entries)
            .map(|(spec, entry)| portsmith.register_route(&spec.network, &spec.contract, entry)),
    )
    .await;

    let rows = specs
        .iter()
        .zip(results)
        .map(|(spec, result)| Row {
            network: spec.network.clone(),
            contract: spec.contract.clone(),
            result: result.map(|status| Detail::Route {
                chain_id: spec.chain_id.clone(),
                status,
            }),
        })
        .collect();
    finish(rows)
}

fn status(portsmith: &Portsmith, args: StatusArgs) -> Result<()> {
    let store = portsmith.store();
    let live: Vec<_> = store
        .all()?
        .into_iter()
        .filter(|r| args.network.as_deref().is_none_or(|n| r.network == n))
        .collect();

    let mut history = Vec::new();
    if args.history {
        let networks: BTreeSet<&str> = match args.network.as_deref() {
            Some(network) => BTreeSet::from([network]),
            None => portsmith
                .registry()
                .names()
                .chain(live.iter().map(|r| r.network.as_str()))
                .collect(),
        };
        for network in networks {
            history.extend(store.load_network(network)?.superseded);
        }
    }

    if args.json {
        let out = serde_json::json!({ "records": live, "superseded": history });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if live.is_empty() && history.is_empty() {
        tracing::info!(manifest_dir = %store.dir().display(), "No deployments recorded");
    } else {
        println!("{}", report::records(&live, &history));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let path = config_path(cli.config);
    let config = Config::load(path.as_deref()).context("Failed to load configuration")?;
    let portsmith = orchestrator(&config, cli.lock_mode)?;

    tracing::debug!(
        networks = portsmith.registry().len(),
        manifest_dir = %portsmith.store().dir().display(),
        "Orchestrator ready"
    );

    match cli.command {
        Command::Reconcile(args) => reconcile(&portsmith, &config, args).await,
        Command::Import(args) => import(&portsmith, args).await,
        Command::DeployDirect(args) => deploy_direct(&portsmith, args).await,
        Command::Routes(args) => routes(&portsmith, &config, args).await,
        Command::Status(args) => status(&portsmith, args),
    }
}
