//! liveops-node - a coordinator plus a sample wallet service in one process.
//!
//! The wallet reduces `SERVER/CHANGE_COINS` against in-process balances and
//! periodically emits a purchase transaction that charges coins and then
//! grants an item. Purchases the balance cannot cover are reverted.
//!
//! ```bash
//! RUST_LOG=liveops=debug cargo run --package liveops-node -- --emit-every-secs 2
//! ```
//!
//! With `--features etcd`, `--etcd-endpoints` switches the store to etcd.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use liveops::action::change_numeric_value;
use liveops::prelude::*;
use liveops::storage::memory_store::MemoryStore;
use serde_json::json;
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "liveops-node")]
#[command(about = "Runs a liveops coordinator and a sample wallet service")]
struct Args {
    /// Key prefix shared by every process of the deployment.
    #[arg(long, env = "LIVEOPS_PREFIX", default_value = "liveops")]
    prefix: String,

    /// Segment served by this node.
    #[arg(long, env = "LIVEOPS_SEGMENT")]
    segment: Option<String>,

    #[arg(long, env = "LIVEOPS_BUCKET_COUNT", default_value_t = 256)]
    bucket_count: u32,

    #[arg(long, env = "LIVEOPS_POLL_INTERVAL_MS", default_value_t = 100)]
    poll_interval_ms: u64,

    #[arg(long, env = "LIVEOPS_HEARTBEAT_INTERVAL_MS", default_value_t = 1000)]
    heartbeat_interval_ms: u64,

    #[arg(long, env = "LIVEOPS_STATUS_CHECK_INTERVAL_MS", default_value_t = 2000)]
    status_check_interval_ms: u64,

    /// Group name of the sample service.
    #[arg(long, env = "LIVEOPS_SERVICE_NAME", default_value = "wallet")]
    service_name: String,

    /// Emit a sample purchase this often; 0 disables it.
    #[arg(long, env = "LIVEOPS_EMIT_EVERY_SECS", default_value_t = 5)]
    emit_every_secs: u64,

    /// etcd endpoints, comma-separated. Without it the store is in-memory.
    #[cfg(feature = "etcd")]
    #[arg(long, env = "ETCD_ENDPOINTS")]
    etcd_endpoints: Option<String>,
}

impl Args {
    fn config(&self) -> LiveOpsConfig {
        let status_check_interval = Duration::from_millis(self.status_check_interval_ms);
        LiveOpsConfig {
            prefix: self.prefix.clone(),
            segment: self.segment.clone(),
            bucket_count: self.bucket_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            side_effect_poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            status_check_interval,
            leader_lock_ttl: status_check_interval * 3,
            ..Default::default()
        }
    }
}

async fn connect_store(args: &Args) -> Result<Arc<dyn SharedStore>> {
    #[cfg(feature = "etcd")]
    if let Some(endpoints) = &args.etcd_endpoints {
        let endpoints: Vec<String> = endpoints.split(',').map(|s| s.trim().to_string()).collect();
        tracing::info!("Connecting to etcd: {:?}", endpoints);
        let client = etcd_client::Client::connect(endpoints, None).await?;
        return Ok(Arc::new(liveops::storage::etcd_store::EtcdStore::new(
            client,
            format!("/{}/", args.prefix),
        )));
    }
    let _ = args;
    tracing::info!("Using in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}

type Balances = Arc<Mutex<HashMap<String, i64>>>;

fn wallet(store: Arc<dyn SharedStore>, config: LiveOpsConfig, balances: Balances) -> Result<LiveOpsService> {
    let mut service = LiveOpsService::new(store, config);
    service
        .action(
            "SERVER/CHANGE_COINS",
            ActionDescriptor::new().reducer(reducer_fn(move |ctx| {
                let balances = balances.clone();
                async move {
                    let client = ctx.client.clone().unwrap_or_default();
                    let amount = ctx.action.payload["amount"].as_i64().unwrap_or(0);
                    let mut balances = balances.lock().await;
                    let balance = balances.entry(client.clone()).or_insert(100);
                    if *balance + amount < 0 {
                        tracing::info!(client = %client, balance = *balance, amount, "insufficient coins");
                        return Ok(Reduction::Failed);
                    }
                    *balance += amount;
                    tracing::info!(client = %client, balance = *balance, "coins changed");
                    Ok(Reduction::Done)
                }
            })),
        )?
        .action(
            "SHOP/GRANT_ITEM",
            ActionDescriptor::new()
                .reducer(reducer_fn(|ctx| async move {
                    tracing::info!(
                        client = ctx.client.as_deref().unwrap_or_default(),
                        item = %ctx.action.payload["item"],
                        "item granted"
                    );
                    Ok(Reduction::Done)
                }))
                .trigger(trigger_fn(|ctx| async move {
                    tracing::info!(
                        client = ctx.client.as_deref().unwrap_or_default(),
                        transaction = ?ctx.action.transaction(),
                        "purchase completed"
                    );
                    Ok(())
                })),
        )?;
    Ok(service)
}

fn purchase(client: &str, price: i64, item: &str) -> Result<Action, LiveOpsError> {
    Ok(transaction(
        change_numeric_value(Some(client), "coins", -price, json!({}))?,
        vec![Action::new("SHOP/GRANT_ITEM", json!({ "item": item })).with_client(client)],
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("liveops_node=info".parse()?))
        .init();

    let args = Args::parse();
    let config = args.config();
    config.validate()?;
    tracing::info!("liveops-node starting with prefix {:?}", config.prefix);

    let store = connect_store(&args).await?;

    let coordinator = Arc::new(Coordinator::new(store.clone(), config.clone())?);
    coordinator.start().await?;

    let balances: Balances = Arc::new(Mutex::new(HashMap::new()));
    let running = wallet(store, config, balances)?
        .start(args.service_name.clone(), env!("CARGO_PKG_VERSION"))
        .await?;
    tracing::info!("Service {} registered as {}", args.service_name, running.instance().id());

    let emitter = running.emitter().clone();
    let emit_every = args.emit_every_secs;
    let producer = tokio::spawn(async move {
        if emit_every == 0 {
            return;
        }
        let mut round: i64 = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(emit_every)).await;
            round += 1;
            let client = format!("player-{}", round % 3);
            let emitted = match purchase(&client, 30, "sword") {
                Ok(action) => emitter.enqueue(action).await,
                Err(e) => Err(e),
            };
            match emitted {
                Ok(bucket) => tracing::info!("Emitted purchase for {} to {}", client, bucket),
                Err(e) => tracing::warn!("Failed to emit purchase: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    producer.abort();
    running.shutdown().await?;
    coordinator.shutdown().await?;
    Ok(())
}
