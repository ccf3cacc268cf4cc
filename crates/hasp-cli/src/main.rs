//! Hasp operator CLI
//!
//! Inspects and repairs lock state in a shared Redis lease store without
//! joining the cluster as a lock node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hasp_common::{KeySpace, LockConfig, LockKey, LockType, current_timestamp};
use hasp_lock::{DetectionReport, LockSet, load_cluster_view, recover_cycles};
use hasp_store::{RedisLeaseStore, RetryPolicy, RetryingStore};
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const CLI_COORDINATOR: &str = "hasp-cli";

#[derive(Debug, Parser)]
#[command(name = "hasp", version, about = "Inspect and repair hasp lock state")]
struct Cli {
    /// Configuration file; `HASP_*` environment variables override it
    #[arg(short = 'c', long = "config", env = "HASP_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long = "redis-url", env = "HASP_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
    #[arg(long = "log-level", env = "HASP_LOG_LEVEL", default_value = "warn")]
    log_level: String,
    /// Print results as JSON
    #[arg(long = "json")]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List detector nodes and their heartbeat age
    Nodes,
    /// Run one cluster-wide deadlock scan
    Detect {
        /// Release victims and excise stale nodes
        #[arg(long = "recover")]
        recover: bool,
    },
    /// Show the number of waiters queued on a fair lock
    Queue { class: String, id: String },
    /// Show who holds a lease
    Holder {
        lock_type: LockType,
        class: String,
        id: String,
    },
    /// Delete a lease regardless of its holder
    ForceRelease {
        lock_type: LockType,
        class: String,
        id: String,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}

fn format_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn print_report(report: &DetectionReport) {
    println!("coordinator: {}", report.coordinator);
    println!("live nodes:  {}", report.live_nodes.join(", "));
    if !report.excised_nodes.is_empty() {
        println!("excised:     {}", report.excised_nodes.join(", "));
    }
    if report.cycles.is_empty() {
        println!("no deadlock cycles");
    }
    for cycle in &report.cycles {
        let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        println!("cycle: {}", members.join(" -> "));
    }
    for event in &report.recoveries {
        println!(
            "recovered: victim {} released [{}]",
            event.victim,
            event.released.join(", ")
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = LockConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let redis = RedisLeaseStore::new(&cli.redis_url)
        .with_context(|| format!("connecting to {}", cli.redis_url))?;
    redis.health_check().await.context("store health check")?;
    let store = RetryingStore::new(Arc::new(redis), RetryPolicy::from_config(&config));
    let keys = KeySpace::new(config.namespace.clone());

    match cli.command {
        Command::Nodes => {
            let now = current_timestamp();
            let view =
                load_cluster_view(&store, &keys, config.node_timeout(), now, false).await?;
            if cli.json {
                let live: Vec<_> = view
                    .live_nodes
                    .iter()
                    .map(|(node, at)| serde_json::json!({ "node_id": node, "heartbeat_ms": at }))
                    .collect();
                let out = serde_json::json!({ "live": live, "stale": view.stale_nodes });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            for (node, at) in &view.live_nodes {
                println!(
                    "{:<24} live   last heartbeat {} ({} ms ago)",
                    node,
                    format_time(*at),
                    now - at
                );
            }
            for node in &view.stale_nodes {
                println!("{:<24} stale", node);
            }
        }
        Command::Detect { recover } => {
            let now = current_timestamp();
            let view =
                load_cluster_view(&store, &keys, config.node_timeout(), now, recover).await?;
            let cycles = view.graph.find_cycles();
            let recoveries = if recover && !cycles.is_empty() {
                let locks = LockSet::new(store.clone(), keys.clone(), &config);
                recover_cycles(&store, &keys, &locks, &view.graph, &cycles, CLI_COORDINATOR)
                    .await?
            } else {
                Vec::new()
            };
            let report = DetectionReport {
                at_ms: now,
                coordinator: CLI_COORDINATOR.to_string(),
                live_nodes: view.live_nodes.keys().cloned().collect(),
                excised_nodes: if recover { view.stale_nodes } else { Vec::new() },
                cycles,
                recoveries,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Queue { class, id } => {
            let key = LockKey::new(class, id)?;
            let len = store.queue_len(&keys.fair_queue(&key)).await?;
            println!("{}", len);
        }
        Command::Holder {
            lock_type,
            class,
            id,
        } => {
            let key = LockKey::new(class, id)?;
            if lock_type == LockType::Read {
                let readers = store.counter_value(&keys.readers(&key)).await?;
                println!("{} readers", readers);
            } else {
                match store.current_token(&keys.lease_key(lock_type, &key)).await? {
                    Some(token) => println!("{}", token),
                    None => println!("free"),
                }
            }
        }
        Command::ForceRelease {
            lock_type,
            class,
            id,
        } => {
            if lock_type == LockType::Read {
                bail!(
                    "read leases are released by their readers; force-release the writer instead"
                );
            }
            let key = LockKey::new(class, id)?;
            let lease = keys.lease_key(lock_type, &key);
            if store.force_delete(&lease).await? {
                info!(key = %lease, "Force released lease");
                println!("released {}", lease);
            } else {
                println!("{} was not held", lease);
            }
        }
    }

    Ok(())
}
