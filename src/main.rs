use clap::{Parser, Subcommand};
use marketplace_settlement::application::runtime::{Adapters, SettlementEngine};
use marketplace_settlement::config::{EngineArgs, GatewayArgs};
use marketplace_settlement::domain::ports::{
    PaymentGatewayRef, PhotoServiceRef, TransactionRepositoryRef, WalletRepositoryRef,
};
use marketplace_settlement::domain::wallet::Wallet;
use marketplace_settlement::infrastructure::gateway::sandbox::SandboxGateway;
use marketplace_settlement::infrastructure::gateway::snap::{SnapConfig, SnapGateway};
use marketplace_settlement::infrastructure::in_memory::InMemoryStore;
use marketplace_settlement::infrastructure::photo::{HttpPhotoService, StaticPhotoCatalog};
use marketplace_settlement::infrastructure::pubsub::{
    InMemoryBroker, InMemoryCache, InMemoryRecoveryStream,
};
use marketplace_settlement::interfaces::csv::catalog_reader::CatalogReader;
use marketplace_settlement::interfaces::csv::wallet_writer::WalletWriter;
use marketplace_settlement::interfaces::script::ScriptRunner;
use miette::{IntoDiagnostic, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(flatten)]
    gateway: GatewayArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a JSON-lines command script, then prints every wallet as CSV.
    Replay {
        script: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Reads commands from stdin until EOF or Ctrl+C, then prints every wallet as CSV.
    Serve {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Photo catalog CSV; its creators get a wallet on startup.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

struct Storage {
    transactions: TransactionRepositoryRef,
    wallets: WalletRepositoryRef,
}

fn setup_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[cfg(feature = "storage-rocksdb")]
fn open_storage(db_path: Option<&Path>) -> Result<Storage> {
    use marketplace_settlement::infrastructure::rocksdb::RocksDBStore;

    if let Some(path) = db_path {
        let store = RocksDBStore::open(path).into_diagnostic()?;
        info!(path = %path.display(), "using rocksdb storage");
        return Ok(Storage {
            transactions: Arc::new(store.clone()),
            wallets: Arc::new(store),
        });
    }
    Ok(in_memory_storage())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_storage(db_path: Option<&Path>) -> Result<Storage> {
    if let Some(path) = db_path {
        warn!(
            path = %path.display(),
            "built without the storage-rocksdb feature, falling back to in-memory storage"
        );
    }
    Ok(in_memory_storage())
}

fn in_memory_storage() -> Storage {
    let store = InMemoryStore::new();
    Storage {
        transactions: Arc::new(store.clone()),
        wallets: Arc::new(store),
    }
}

fn load_catalog(path: Option<&Path>) -> Result<StaticPhotoCatalog> {
    let catalog = StaticPhotoCatalog::default();
    let Some(path) = path else {
        return Ok(catalog);
    };
    let file = File::open(path).into_diagnostic()?;
    for photo in CatalogReader::new(file).photos() {
        match photo {
            Ok(photo) => catalog.insert(photo),
            Err(e) => warn!(error = %e, "skipping catalog row"),
        }
    }
    Ok(catalog)
}

async fn seed_wallets(wallets: &WalletRepositoryRef, creators: BTreeSet<Uuid>) -> Result<()> {
    for creator_id in creators {
        if wallets.find_by_creator(creator_id).await.into_diagnostic()?.is_none() {
            wallets.create(&Wallet::new(creator_id)).await.into_diagnostic()?;
        }
    }
    Ok(())
}

struct Wiring {
    engine: SettlementEngine,
    storage: Storage,
    sandbox: Option<Arc<SandboxGateway>>,
    signing_key: String,
}

async fn start(cli: &Cli, store: &StoreArgs) -> Result<Wiring> {
    let storage = open_storage(store.db_path.as_deref())?;
    let catalog = load_catalog(store.catalog.as_deref())?;
    seed_wallets(&storage.wallets, catalog.creators()).await?;

    let photos: PhotoServiceRef = match &cli.gateway.photo_service_url {
        Some(url) => Arc::new(
            HttpPhotoService::new(url.clone(), cli.gateway.request_timeout()).into_diagnostic()?,
        ),
        None => Arc::new(catalog),
    };

    let config = cli.engine.settlement_config();
    let (gateway, sandbox, signing_key) = match &cli.gateway.server_key {
        Some(server_key) => {
            let snap: PaymentGatewayRef = Arc::new(
                SnapGateway::new(SnapConfig {
                    snap_url: cli.gateway.snap_url.clone(),
                    api_url: cli.gateway.api_url.clone(),
                    server_key: server_key.clone(),
                    request_timeout: cli.gateway.request_timeout(),
                })
                .into_diagnostic()?,
            );
            (snap, None, server_key.clone())
        }
        None => {
            let sandbox = Arc::new(
                SandboxGateway::new(cli.gateway.sandbox_key.clone())
                    .with_offset(config.reconcile.gateway_offset),
            );
            info!("no gateway server key configured, using the sandbox gateway");
            let gateway: PaymentGatewayRef = sandbox.clone();
            (gateway, Some(sandbox), cli.gateway.sandbox_key.clone())
        }
    };

    let adapters = Adapters {
        transactions: storage.transactions.clone(),
        wallets: storage.wallets.clone(),
        gateway,
        photos,
        cache: Arc::new(InMemoryCache::new()),
        recovery: Arc::new(InMemoryRecoveryStream::new()),
        events: Arc::new(InMemoryBroker::new()),
    };
    let engine = SettlementEngine::start(adapters, config).await.into_diagnostic()?;
    Ok(Wiring {
        engine,
        storage,
        sandbox,
        signing_key,
    })
}

fn runner<'a>(cli: &Cli, wiring: &'a Wiring) -> ScriptRunner<'a> {
    let runner = ScriptRunner::new(
        &wiring.engine,
        wiring.storage.transactions.clone(),
        wiring.signing_key.clone(),
        cli.engine.gateway_offset,
    );
    match &wiring.sandbox {
        Some(sandbox) => runner.with_sandbox(sandbox.clone()),
        None => runner,
    }
}

async fn finish(wiring: Wiring) -> Result<()> {
    wiring.engine.shutdown().await;
    let wallets = wiring.storage.wallets.list().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = WalletWriter::new(stdout.lock());
    writer.write_wallets(wallets).into_diagnostic()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match &cli.command {
        Command::Replay { script, store } => {
            let file = File::open(script).into_diagnostic()?;
            let lines = BufReader::new(file)
                .lines()
                .collect::<io::Result<Vec<_>>>()
                .into_diagnostic()?;

            let wiring = start(&cli, store).await?;
            let results = runner(&cli, &wiring).run_lines(lines).await;
            let failed = results.iter().filter(|result| result.is_err()).count();
            info!(commands = results.len(), failed, "script replayed");
            finish(wiring).await
        }
        Command::Serve { store } => {
            let wiring = start(&cli, store).await?;
            let mut script = runner(&cli, &wiring);
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line.into_diagnostic()? {
                        Some(line) => {
                            script.run_lines([line]).await;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down gracefully...");
                        break;
                    }
                }
            }
            drop(script);
            finish(wiring).await
        }
    }
}
