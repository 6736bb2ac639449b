//! chainhead CLI: follow the canonical head of an EVM chain.
//!
//! Usage:
//! ```bash
//! # Print every new longest chain until Ctrl-C
//! chainhead follow --url wss://ethereum-rpc.publicnode.com
//!
//! # Load tracker settings from a file and override one of them
//! chainhead follow --url ws://localhost:8546 --config tracker.json --finality-depth 12
//!
//! # Show the default tracker configuration
//! chainhead info
//! ```

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::global;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainhead_core::health::all_healthy;
use chainhead_core::{
    Head, HeadBroadcaster, HeadClient, HeadSaver, HeadTrackable, HeadTracker, HeadTrackerConfig,
    HealthReporter, MailboxMonitor, MetricsSink, OtelMetrics,
};
use chainhead_evm::{EvmHead, WsClientConfig, WsHeadClient};
use chainhead_storage::InMemoryHeadSaver;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "follow" => cmd_follow(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainhead {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainhead {}", env!("CARGO_PKG_VERSION"));
    println!("Track the canonical chain head of an EVM node\n");
    println!("USAGE:");
    println!("    chainhead <COMMAND>\n");
    println!("COMMANDS:");
    println!("    follow   Track heads from a WebSocket endpoint and print each new longest chain");
    println!("    info     Show the default tracker configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("FOLLOW FLAGS:");
    println!("    --url <URL>               WebSocket RPC endpoint  [required]");
    println!("    --config <PATH>           JSON tracker configuration");
    println!("    --finality-depth <N>      Override finality_depth");
    println!("    --sampling-interval <MS>  Override sampling_interval (0 = every head)");
    println!("    --json                    Emit JSON logs and JSON head lines");
}

fn cmd_info() {
    let config = HeadTrackerConfig::default();
    println!("ChainHead v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default finality depth:   {} blocks", config.finality_depth);
    println!("  Default history depth:    {} blocks", config.history_depth);
    println!("  Default mailbox capacity: {}", config.max_buffer_size);
    println!("  Default sampling:         {:?}", config.sampling_interval);
    println!("  Default callback timeout: {:?}", config.callback_timeout);
    println!("  Default backfill timeout: {:?}", config.backfill_timeout);
    println!("  Storage backends: memory");
    println!("  Chains: EVM (newHeads over WebSocket)");
}

async fn cmd_follow(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let json = args.iter().any(|a| a == "--json");
    init_tracing(json);

    let config = load_config(args)?;
    tracing::info!(?config, "Tracker configuration");

    let client = WsHeadClient::connect(url, WsClientConfig::default())
        .await
        .map_err(|e| e.to_string())?;
    let chain_id = client.configured_chain_id().to_string();

    // The global meter is a no-op until a provider is installed.
    let meter = global::meter("chainhead");
    let sink: Arc<dyn MetricsSink> = Arc::new(OtelMetrics::new(&meter));
    let stop = CancellationToken::new();
    let monitor = Arc::new(MailboxMonitor::new(sink.clone()));
    let monitor_task = monitor.clone().spawn(Duration::from_secs(10), stop.clone());

    let saver = Arc::new(InMemoryHeadSaver::new(config.history_depth));
    let broadcaster = Arc::new(HeadBroadcaster::new(config.callback_timeout));
    let tracker = HeadTracker::new(config, Arc::new(client), saver, broadcaster.clone(), sink)
        .with_mailbox_monitor(monitor);

    let (latest, unsubscriber) = broadcaster.subscribe(Arc::new(HeadPrinter { json }));
    if let Some(head) = latest {
        tracing::info!(number = head.block_number(), "Resuming from saved head");
    }

    tracker.start().await.map_err(|e| e.to_string())?;
    match tracker.latest_and_finalized_block().await {
        Ok((latest, finalized)) => tracing::info!(
            latest = latest.block_number(),
            finalized = finalized.block_number(),
            "Node head and finalized block"
        ),
        Err(e) => tracing::warn!(error = %e, "Could not determine the finalized block"),
    }
    tracing::info!("Following heads, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    tracing::info!("Shutting down");

    unsubscriber.unsubscribe();
    tracker.close().await;
    stop.cancel();
    let _ = monitor_task.await;

    print_summary(&tracker, &chain_id);
    Ok(())
}

/// Build the tracker config from `--config` plus individual flag overrides.
fn load_config(args: &[String]) -> Result<HeadTrackerConfig, String> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => {
            let text = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
            HeadTrackerConfig::from_json(&text).map_err(|e| e.to_string())?
        }
        None => HeadTrackerConfig::default(),
    };
    if let Some(depth) = parse_flag(args, "--finality-depth") {
        config.finality_depth = depth
            .parse()
            .map_err(|_| format!("invalid --finality-depth: {depth}"))?;
    }
    if let Some(ms) = parse_flag(args, "--sampling-interval") {
        let ms: u64 = ms
            .parse()
            .map_err(|_| format!("invalid --sampling-interval: {ms}"))?;
        config.sampling_interval = Duration::from_millis(ms);
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn print_summary<C, S>(tracker: &HeadTracker<EvmHead, C, S>, chain_id: &str)
where
    C: HeadClient<EvmHead>,
    S: HeadSaver<EvmHead>,
{
    println!("\nSummary (chain {chain_id}):");
    match tracker.latest_chain() {
        Some(head) => {
            println!("  Current head:      #{} {}", head.block_number(), head.hash());
            println!("  Chain in memory:   {} blocks", head.chain_length());
        }
        None => println!("  Current head:      none"),
    }

    let report = tracker.health_report();
    if !all_healthy(&report) {
        for (name, err) in &report {
            if let Some(err) = err {
                println!("  {name}: {err}");
            }
        }
    }
}

/// Prints every new longest chain to stdout.
struct HeadPrinter {
    json: bool,
}

#[async_trait]
impl HeadTrackable<EvmHead> for HeadPrinter {
    fn name(&self) -> &str {
        "HeadPrinter"
    }

    async fn on_new_longest_chain(&self, _ctx: CancellationToken, head: EvmHead) {
        if self.json {
            let line = serde_json::json!({
                "number": head.block_number(),
                "hash": head.hash(),
                "parent_hash": head.parent_hash(),
                "timestamp": head.timestamp(),
                "chain_length": head.chain_length(),
            });
            println!("{line}");
        } else {
            println!(
                "#{:<10} {}  (chain length {})",
                head.block_number(),
                head.hash(),
                head.chain_length()
            );
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
