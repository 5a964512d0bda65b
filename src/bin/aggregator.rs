//! Aggregator Binary - Deduplicating Event Ingestion
//!
//! Reads JSONL publish bodies (one event or `{"events": [...]}` per line),
//! persists each `(topic, event_id)` once and reports counters.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin aggregator -- run                          # stdin
//! cargo run --release --bin aggregator -- run --input events.jsonl
//! cargo run --release --bin aggregator -- run --input events.jsonl --follow
//! cargo run --release --bin aggregator -- events --topic user.created
//! cargo run --release --bin aggregator -- count
//! ```
//!
//! ## Environment Variables
//!
//! - EVENTFLOW_DB_PATH - SQLite database path (default: data/dedup_store.db)
//! - EVENTFLOW_QUEUE_CAPACITY - Ingest queue bound, 0 for unbounded (default: 10000)
//! - EVENTFLOW_STORE_MAX_RETRIES - Retries for transient store faults (default: 5)
//! - EVENTFLOW_RETRY_INITIAL_MS / EVENTFLOW_RETRY_MAX_MS - Retry backoff (default: 50 / 2000)
//! - EVENTFLOW_SHUTDOWN_MODE - drain | abandon, used on Ctrl-C (default: drain)
//! - EVENTFLOW_STATS_INTERVAL_SECS - Stats log interval (default: 10)
//! - RUST_LOG - Logging level (optional, default: info)

use eventflow::ingress::{self, decode_line, ReadMode, TailReader};
use eventflow::{Aggregator, AggregatorConfig, EventStore, ShutdownMode, SqliteEventStore};
use std::env;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;

const USAGE: &str = "Usage:
  aggregator run [--input PATH] [--follow]
  aggregator events [--topic TOPIC]
  aggregator count";

#[derive(Debug)]
enum Command {
    Run { input: Option<PathBuf>, follow: bool },
    Events { topic: Option<String> },
    Count,
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|x| x == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

fn parse_command_from_args() -> Option<Command> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(|s| s.as_str()) {
        Some("run") => {
            let input = flag_value(&args, "--input").map(PathBuf::from);
            let follow = args.contains(&"--follow".to_string());
            if follow && input.is_none() {
                return None;
            }
            Some(Command::Run { input, follow })
        }
        Some("events") => Some(Command::Events {
            topic: flag_value(&args, "--topic"),
        }),
        Some("count") => Some(Command::Count),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let Some(command) = parse_command_from_args() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = AggregatorConfig::from_env()?;

    match command {
        Command::Run { input, follow } => run(config, input, follow).await,
        Command::Events { topic } => {
            let store = SqliteEventStore::open(&config.db_path)?;
            let events = store.query_all(topic.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        Command::Count => {
            let store = SqliteEventStore::open(&config.db_path)?;
            println!("{}", store.count_all().await?);
            Ok(())
        }
    }
}

async fn run(
    config: AggregatorConfig,
    input: Option<PathBuf>,
    follow: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("🚀 Starting Event Aggregator");
    log::info!("   Database: {}", config.db_path.display());
    match &input {
        Some(path) if follow => log::info!("   Input: {} (follow)", path.display()),
        Some(path) => log::info!("   Input: {}", path.display()),
        None => log::info!("   Input: stdin"),
    }
    log::info!("   Shutdown mode: {}", config.shutdown_mode);
    log::info!("   Stats interval: {}s", config.stats_interval.as_secs());

    let (aggregator, mut worker) = Aggregator::start(&config)?;

    let mut reader_task = tokio::spawn(read_input(aggregator.clone(), input, follow));

    let mut stats_ticker = interval(config.stats_interval);
    stats_ticker.tick().await; // Skip first immediate tick

    log::info!("✅ Aggregator running - processing events...");

    let mode = loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Interrupted");
                reader_task.abort();
                break config.shutdown_mode;
            }

            result = worker.wait() => {
                // The worker only stops on its own after a fatal store fault
                reader_task.abort();
                let stats = aggregator.get_stats();
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return match result {
                    Ok(report) => {
                        log::warn!("Consumer worker exited early: {:?}", report);
                        Err("consumer worker exited early".into())
                    }
                    Err(e) => {
                        log::error!("❌ Consumer worker failed: {}", e);
                        Err(e.into())
                    }
                };
            }

            result = &mut reader_task => {
                match result {
                    Ok(Ok(())) => log::info!("📭 End of input"),
                    Ok(Err(e)) => log::error!("Input stream error: {}", e),
                    Err(e) => log::error!("Input task failed: {}", e),
                }
                break ShutdownMode::Drain;
            }

            _ = stats_ticker.tick() => {
                let stats = aggregator.get_stats();
                log::info!(
                    "📊 received: {} | unique: {} | duplicates: {} | in flight: {} | topics: {}",
                    stats.received,
                    stats.unique_processed,
                    stats.duplicate_dropped,
                    stats.in_flight(),
                    stats.topics.len()
                );
            }
        }
    };

    let report = worker.shutdown(mode).await?;
    log::info!(
        "✅ Worker stopped: {} unique, {} duplicates, {} abandoned",
        report.unique_processed,
        report.duplicate_dropped,
        report.abandoned
    );

    let stats = aggregator.get_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Publish every line of the input. Invalid lines are logged and skipped.
async fn read_input(
    aggregator: Aggregator,
    input: Option<PathBuf>,
    follow: bool,
) -> std::io::Result<()> {
    match input {
        Some(path) => {
            let mode = if follow { ReadMode::Follow } else { ReadMode::Once };
            let mut reader = TailReader::new(path, mode);
            reader.start().await?;
            while let Some(line) = reader.read_line().await? {
                if !publish_line(&aggregator, reader.line_number(), &line).await {
                    break;
                }
            }
        }
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).split(b'\n');
            let mut line_number = 0u64;
            while let Some(bytes) = lines.next_segment().await? {
                line_number += 1;
                let line = match decode_line(&bytes) {
                    Ok(Some(line)) => line,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("Rejected input line {}: {}", line_number, e);
                        continue;
                    }
                };
                if !publish_line(&aggregator, line_number, line).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Returns `false` once the queue stops accepting events.
async fn publish_line(aggregator: &Aggregator, line_number: u64, line: &str) -> bool {
    match ingress::publish(aggregator, line).await {
        Ok(receipt) => receipt.queued == receipt.received,
        Err(e) => {
            log::warn!("Rejected input line {}: {}", line_number, e);
            true
        }
    }
}
