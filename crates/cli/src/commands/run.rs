use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Args;
use comet_keeper_core::{
    AddressLookupTable, AppConfig, ConfigWatcher, LedgerReader, LedgerSubmitter, LedgerSubscriber,
};
use comet_keeper_ledger::{
    AccountSet, JsonRpcLedger, KeeperSigner, OperationBuilder, PushSubscriber, RpcConfig,
    SimulatedLedger,
};
use comet_keeper_manager::{
    BatchBuilder, ControlLoop, CycleOutcome, StateCache, UPDATE_CHANNEL_CAPACITY,
};
use tracing::{error, info, warn};

use super::load_config;

const RPC_TIMEOUT_SECS: u64 = 10;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Keeper.toml")]
    pub config: PathBuf,
    /// Profile overlay (loads Keeper.<profile>.toml on top)
    #[arg(short, long)]
    pub profile: Option<String>,
    /// Run against an in-memory ledger loaded from this JSON fixture
    #[arg(long)]
    pub paper: Option<PathBuf>,
    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config, args.profile.as_deref())?;
    let programs = config.program_ids().context("Invalid program ids")?;
    let accounts = AccountSet::derive(programs);

    info!(
        config = %args.config.display(),
        owner = %programs.manager_owner,
        manager = %accounts.manager_info,
        paper = args.paper.is_some(),
        "Starting comet keeper"
    );

    if let Some(fixture) = &args.paper {
        let ledger = Arc::new(
            SimulatedLedger::from_fixture(fixture)
                .with_context(|| format!("Failed to load fixture {}", fixture.display()))?,
        );
        let subscriber = Arc::clone(&ledger);
        return drive(ledger, subscriber, accounts, config, &args).await;
    }

    let signer = KeeperSigner::load(&config.signer)
        .await
        .context("Failed to load signer key")?;
    if signer.authority() != programs.manager_owner {
        bail!(
            "Signer key {} does not match manager.owner {}",
            signer.authority(),
            programs.manager_owner
        );
    }
    let rpc = RpcConfig {
        url: config.ledger.rpc_url.clone(),
        requests_per_second: NonZeroU32::new(config.ledger.requests_per_second)
            .context("ledger.requests_per_second must be > 0")?,
        timeout_secs: RPC_TIMEOUT_SECS,
    };
    let ledger = Arc::new(
        JsonRpcLedger::new(rpc, accounts.clone(), Arc::new(signer))
            .context("Failed to create ledger client")?,
    );
    let subscriber = Arc::new(PushSubscriber::new(
        config.ledger.ws_url.clone(),
        accounts.clone(),
    ));
    drive(ledger, subscriber, accounts, config, &args).await
}

async fn drive<L, S>(
    ledger: Arc<L>,
    subscriber: Arc<S>,
    accounts: AccountSet,
    config: AppConfig,
    args: &RunArgs,
) -> anyhow::Result<()>
where
    L: LedgerReader + LedgerSubmitter + 'static,
    S: LedgerSubscriber + 'static,
{
    let table = resolve_lookup_table(ledger.as_ref(), &config, &accounts).await?;
    let batches = BatchBuilder::new(OperationBuilder::new(accounts), Some(table));

    let (cache, updates) = StateCache::new(UPDATE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        if let Err(e) = subscriber.subscribe(updates).await {
            error!(error = %e, "Push subscription ended");
        }
    });

    let mut keeper = ControlLoop::new(
        ledger,
        cache,
        batches,
        config.manager.clone(),
        config.failure_backoff.clone(),
    );

    if args.once {
        return match keeper.run_once().await {
            CycleOutcome::Failed { kind } => bail!("Cycle failed: {kind}"),
            _ => Ok(()),
        };
    }

    // Profile overlays are not re-applied on reload; only the base file is watched.
    let (watcher, config_updates) = ConfigWatcher::new(config);
    let config_path = args.config.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher.watch(&config_path).await {
            warn!(error = %e, "Config watcher stopped, tunables are now fixed");
        }
    });
    let keeper = keeper.with_config_updates(config_updates);

    tokio::select! {
        () = keeper.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    Ok(())
}

/// Reads the configured address-compression table, or publishes one holding
/// the static references when none is configured.
async fn resolve_lookup_table<L>(
    ledger: &L,
    config: &AppConfig,
    accounts: &AccountSet,
) -> anyhow::Result<AddressLookupTable>
where
    L: LedgerReader + LedgerSubmitter,
{
    if let Some(address) = config.lookup_table()? {
        let table = ledger
            .lookup_table(&address)
            .await?
            .with_context(|| format!("Lookup table {address} not found on ledger"))?;
        info!(address = %table.address, entries = table.entries.len(), "Using lookup table");
        return Ok(table);
    }

    let pools = ledger.pools().await.context("Failed to read pools")?;
    let pool_count = u8::try_from(pools.value.len()).context("Too many pools for lookup table")?;
    let table = ledger
        .publish_lookup_table(&accounts.static_references(pool_count))
        .await
        .context("Failed to publish lookup table")?;
    info!(
        address = %table.address,
        entries = table.entries.len(),
        "Published lookup table; set ledger.lookup_table to reuse it"
    );
    Ok(table)
}
