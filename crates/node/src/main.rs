mod config;

use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use schilling_chainstate::{
    BlockChain, BlockStore, ChainEvent, KvBlockStore, MemoryBlockStore, ValidHashStore,
};
use schilling_consensus::{chain_params, hash256_to_hex};
use schilling_net::{PeerGroup, PeerGroupError, SyncState};
use schilling_storage::fjall::{FjallOptions, FjallStore};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, Backend, LogFormat, NodeConfig};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = NodeConfig::resolve(Args::parse())?;
    init_logging(config.log_format)?;

    let params = Arc::new(chain_params(config.network));
    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = open_store(&config)?;
    let checkpoints = config.checkpoints_path();
    let valid_hashes = ValidHashStore::open(Some(checkpoints.as_path()), &params.consensus)?;
    let chain = Arc::new(BlockChain::new(
        Arc::clone(&params),
        store,
        Arc::new(valid_hashes),
    )?);
    let head = chain.chain_head();
    info!(
        network = %config.network,
        backend = ?config.backend,
        data_dir = %config.data_dir.display(),
        height = head.height,
        hash = %hash256_to_hex(&head.hash),
        "chain loaded"
    );

    let wallet_events = tokio::spawn(log_chain_events(chain.subscribe()));
    let group = Arc::new(PeerGroup::new(
        Arc::clone(&params),
        Arc::clone(&chain),
        config.peer_group.clone(),
    ));
    for addr in &config.connect {
        group.add_address(*addr);
    }
    group.start()?;
    let status = spawn_status_logger(Arc::clone(&group), config.status_interval);

    let outcome = drive(&group).await;
    group.stop().await;
    status.abort();
    wallet_events.abort();
    let head = chain.chain_head();
    info!(height = head.height, hash = %hash256_to_hex(&head.hash), "stopped");
    outcome
}

/// Runs until ctrl-c, or until chain sync halts on a storage fault.
async fn drive(group: &PeerGroup) -> Result<()> {
    let initial_sync = group.download_block_chain();
    tokio::pin!(initial_sync);
    let mut updates = group.subscribe_sync();
    let mut syncing = true;
    loop {
        tokio::select! {
            interrupted = signal::ctrl_c() => {
                interrupted.context("listening for ctrl-c")?;
                info!("shutdown requested");
                return Ok(());
            }
            result = &mut initial_sync, if syncing => {
                syncing = false;
                match result {
                    Ok(state) => info!(
                        height = state.chain_height,
                        peers = state.peers,
                        "initial sync complete"
                    ),
                    Err(PeerGroupError::Fatal(reason)) => bail!("chain sync halted: {reason}"),
                    Err(err) => return Err(err.into()),
                }
            }
            failed = wait_for_failure(&mut updates) => {
                if let Some(reason) = failed {
                    bail!("chain sync halted: {reason}");
                }
                return Ok(());
            }
        }
    }
}

/// The failure reason once one is published; `None` if the group goes away first.
async fn wait_for_failure(updates: &mut watch::Receiver<SyncState>) -> Option<String> {
    match updates.wait_for(|state| state.failure.is_some() || state.stopped).await {
        Ok(state) => state.failure.clone(),
        Err(_) => None,
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow!("installing log subscriber: {err}"))
}

fn open_store(config: &NodeConfig) -> Result<Arc<dyn BlockStore>> {
    let store: Arc<dyn BlockStore> = match config.backend {
        Backend::Memory => Arc::new(MemoryBlockStore::new()),
        Backend::Fjall => {
            let path = config.db_path();
            let options = FjallOptions {
                cache_bytes: config.db_cache_bytes,
            };
            let kv = FjallStore::open_with_options(&path, options)
                .with_context(|| format!("opening block store at {}", path.display()))?;
            Arc::new(KvBlockStore::new(kv))
        }
    };
    Ok(store)
}

fn spawn_status_logger(group: Arc<PeerGroup>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let state = group.sync_state();
            let totals = group.net_totals();
            info!(
                height = state.chain_height,
                peer_height = state.best_peer_height,
                peers = state.peers,
                synced = state.synced,
                connections = totals.connections,
                bytes_recv = totals.bytes_recv,
                bytes_sent = totals.bytes_sent,
                known_addrs = group.known_addresses(),
                banned = group.banned_peers().len(),
                "status"
            );
        }
    })
}

/// Stands in for a wallet: reports what the chain publishes.
async fn log_chain_events(mut events: mpsc::UnboundedReceiver<ChainEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChainEvent::BlockConnected { block } => {
                let hash = hash256_to_hex(&block.hash);
                debug!(height = block.height, hash = %hash, "block connected");
            }
            ChainEvent::BlockDisconnected { block } => {
                let hash = hash256_to_hex(&block.hash);
                info!(height = block.height, hash = %hash, "block disconnected");
            }
            ChainEvent::TransactionConnected {
                txid,
                block_hash,
                height,
                ..
            } => {
                debug!(
                    txid = %hash256_to_hex(&txid),
                    block = %hash256_to_hex(&block_hash),
                    height,
                    "transaction confirmed"
                );
            }
            ChainEvent::TransactionDisconnected { txid, height, .. } => {
                info!(txid = %hash256_to_hex(&txid), height, "transaction unconfirmed");
            }
            ChainEvent::Reorganized {
                split,
                old_head,
                new_head,
            } => {
                warn!(
                    split_height = split.height,
                    old_height = old_head.height,
                    new_height = new_head.height,
                    new_head = %hash256_to_hex(&new_head.hash),
                    "chain reorganized"
                );
            }
            ChainEvent::HeadChanged { head } => {
                debug!(height = head.height, hash = %hash256_to_hex(&head.hash), "new chain head");
            }
            ChainEvent::BlockRejected {
                hash,
                source,
                error,
            } => {
                warn!(
                    hash = %hash256_to_hex(&hash),
                    peer = ?source.peer(),
                    error = %error,
                    "block rejected"
                );
            }
        }
    }
}
