use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use sidecar_data::abi_source::{AbiSource, EtherscanClient, NoopAbiSource};
use sidecar_data::chain::ChainGateway;
use sidecar_data::config::Config;
use sidecar_data::contract_caller::{ContractCaller, ReconciledContractCaller, RpcContractCaller};
use sidecar_data::rpc::RpcClient;
use sidecar_data::store::Store;
use sidecar_index::{ChainTip, Pipeline};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

struct AppContext {
    config: Arc<Config>,
}

#[derive(Parser, Debug)]
#[command(name = "sidecar")]
#[command(about = "Indexes EigenLayer protocol state from an Ethereum node")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Overrides SIDECAR_DATABASE_PATH.
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index a range of blocks, optionally following the chain head.
    Run(RunArgs),
    /// Index a single block.
    IndexBlock(IndexBlockArgs),
    /// Reconcile operator restaked strategies for an indexed block.
    ReconcileRestakedStrategies(ReconcileArgs),
    /// Delete derived state and state roots for a block range.
    DeleteState(DeleteStateArgs),
    /// Print stored state roots.
    StateRoots(StateRootsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Defaults to the block after the latest indexed one.
    #[arg(long)]
    start_block: Option<u64>,

    /// Defaults to the current chain head.
    #[arg(long)]
    end_block: Option<u64>,

    /// Keep indexing new blocks once the range is done.
    #[arg(long)]
    follow: bool,

    #[arg(long)]
    reindex: bool,
}

#[derive(Args, Debug)]
struct IndexBlockArgs {
    #[arg(long)]
    block: u64,

    #[arg(long)]
    reindex: bool,
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    #[arg(long)]
    block: u64,
}

#[derive(Args, Debug)]
struct DeleteStateArgs {
    #[arg(long)]
    start_block: u64,

    /// Zero deletes everything from start-block onwards.
    #[arg(long, default_value_t = 0)]
    end_block: u64,
}

#[derive(Args, Debug)]
struct StateRootsArgs {
    #[arg(long)]
    start_block: u64,

    #[arg(long)]
    end_block: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let mut config = Config::from_env().wrap_err("failed to load configuration")?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    let ctx = AppContext {
        config: Arc::new(config),
    };

    match cli.command {
        Commands::Run(args) => handle_run(&ctx, args).await,
        Commands::IndexBlock(args) => handle_index_block(&ctx, args).await,
        Commands::ReconcileRestakedStrategies(args) => handle_reconcile(&ctx, args).await,
        Commands::DeleteState(args) => handle_delete_state(&ctx, args),
        Commands::StateRoots(args) => handle_state_roots(&ctx, args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn open_store(ctx: &AppContext) -> Result<Arc<Store>> {
    if let Some(parent) = Path::new(&ctx.config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    let store = Store::new(&ctx.config.db_path).wrap_err("failed to open SQLite store")?;
    Ok(Arc::new(store))
}

fn gateway(ctx: &AppContext) -> Result<Arc<dyn ChainGateway>> {
    let rpc_url = ctx
        .config
        .rpc_url
        .as_deref()
        .ok_or_else(|| eyre!("SIDECAR_ETHEREUM_RPC_URL is required for this command"))?;
    let client = RpcClient::new(rpc_url)?.with_batch_size(ctx.config.rpc_batch_size);
    Ok(Arc::new(client))
}

/// Historical contract caller. With extra nodes configured, every call must
/// return the same result from the primary node and each extra one.
fn contract_caller(ctx: &AppContext, gateway: Arc<dyn ChainGateway>) -> Result<Arc<dyn ContractCaller>> {
    let primary: Arc<dyn ContractCaller> = Arc::new(RpcContractCaller::new(gateway));
    if ctx.config.contract_call_rpc_urls.is_empty() {
        return Ok(primary);
    }

    let mut callers = vec![primary];
    for url in &ctx.config.contract_call_rpc_urls {
        let client: Arc<dyn ChainGateway> = Arc::new(RpcClient::new(url)?);
        callers.push(Arc::new(RpcContractCaller::new(client)));
    }
    info!(nodes = callers.len(), "reconciling contract calls across nodes");
    Ok(Arc::new(ReconciledContractCaller::new(callers)?))
}

fn build_pipeline(ctx: &AppContext, gateway: Arc<dyn ChainGateway>) -> Result<Pipeline> {
    let store = open_store(ctx)?;
    let abi_source: Arc<dyn AbiSource> = if ctx.config.etherscan_api_keys.is_empty() {
        tracing::warn!("no Etherscan API keys configured, contract ABIs will not be fetched");
        Arc::new(NoopAbiSource)
    } else {
        Arc::new(EtherscanClient::new(
            ctx.config.chain,
            ctx.config.etherscan_api_keys.clone(),
        )?)
    };
    let caller = contract_caller(ctx, gateway.clone())?;
    Pipeline::build(ctx.config.clone(), store, gateway, abi_source, caller)
}

async fn handle_run(ctx: &AppContext, args: RunArgs) -> Result<()> {
    let gateway = gateway(ctx)?;
    let mut pipeline = build_pipeline(ctx, gateway.clone())?;

    let start_block = match args.start_block {
        Some(block) => block,
        None => pipeline
            .store()
            .get_latest_block()?
            .map_or(0, |latest| latest + 1),
    };
    let chain_head = gateway
        .get_latest_block_number()
        .await
        .wrap_err("failed to read chain head")?;
    let end_block = args.end_block.unwrap_or(chain_head);

    info!(
        chain = %ctx.config.chain,
        start_block,
        end_block,
        chain_head,
        follow = args.follow,
        "starting indexer"
    );

    if start_block <= end_block {
        let pb = ProgressBar::new(end_block - start_block + 1);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} blocks {msg}")
                .wrap_err("failed to create progress style")?
                .progress_chars("#>-"),
        );
        for block_number in start_block..=end_block {
            let outcome = pipeline
                .run_for_block(block_number, args.reindex)
                .await
                .wrap_err_with(|| format!("failed to process block {block_number}"))?;
            if let Some(root) = &outcome.state_root {
                pb.set_message(root.state_root.clone());
            }
            pb.inc(1);
        }
        pb.finish_with_message("done");
    }

    if args.follow {
        let tip = ChainTip::new(chain_head);
        let poll_interval = Duration::from_secs(ctx.config.chain_tip_poll_interval_secs.max(1));
        let refresh = tip.spawn_refresh(gateway, poll_interval);
        let next = end_block.max(start_block.saturating_sub(1)) + 1;
        let result = pipeline.follow(next, &tip, poll_interval).await;
        refresh.abort();
        result?;
    }
    Ok(())
}

async fn handle_index_block(ctx: &AppContext, args: IndexBlockArgs) -> Result<()> {
    let mut pipeline = build_pipeline(ctx, gateway(ctx)?)?;
    let outcome = pipeline.run_for_block(args.block, args.reindex).await?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Block".to_string(), outcome.block_number.to_string()]);
    table.add_row(vec![
        "Already indexed".to_string(),
        outcome.already_indexed.to_string(),
    ]);
    table.add_row(vec!["Transactions".to_string(), outcome.transactions.to_string()]);
    table.add_row(vec!["Logs".to_string(), outcome.logs.to_string()]);
    table.add_row(vec!["State changes".to_string(), outcome.state_changes.to_string()]);
    if let Some(summary) = &outcome.restaked_strategies {
        table.add_row(vec![
            "Restaked strategies".to_string(),
            format!("{} new / {} known", summary.inserted, summary.duplicates),
        ]);
    }
    table.add_row(vec![
        "State root".to_string(),
        outcome
            .state_root
            .as_ref()
            .map_or_else(|| "-".to_string(), |root| root.state_root.clone()),
    ]);
    println!("{table}");
    Ok(())
}

async fn handle_reconcile(ctx: &AppContext, args: ReconcileArgs) -> Result<()> {
    let pipeline = build_pipeline(ctx, gateway(ctx)?)?;
    let summary = pipeline.reconcile_restaked_strategies(args.block).await?;
    info!(
        block = args.block,
        pairs = summary.pairs,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "reconciliation complete"
    );
    Ok(())
}

fn handle_delete_state(ctx: &AppContext, args: DeleteStateArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let registry = sidecar_state::StateRegistry::with_default_models(&ctx.config)?;
    registry
        .delete_corrupted_state(&store, args.start_block, args.end_block)
        .wrap_err("failed to delete state")?;
    info!(
        start_block = args.start_block,
        end_block = args.end_block,
        "deleted derived state"
    );
    Ok(())
}

fn handle_state_roots(ctx: &AppContext, args: StateRootsArgs) -> Result<()> {
    if args.start_block > args.end_block {
        return Err(eyre!(
            "invalid range: start-block {} is greater than end-block {}",
            args.start_block,
            args.end_block
        ));
    }
    let store = open_store(ctx)?;
    let roots = store.get_state_roots(args.start_block, args.end_block)?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Block", "Block Hash", "State Root"]);
    for root in &roots {
        table.add_row(vec![
            root.eth_block_number.to_string(),
            root.eth_block_hash.clone(),
            root.state_root.clone(),
        ]);
    }
    println!("{table}");
    info!(count = roots.len(), "state roots listed");
    Ok(())
}
