//! Event hub demo driver
//!
//! This application exercises the hub end to end with synthetic connections:
//! it registers a set of authenticated connections, publishes a burst of
//! channel events, stalls one consumer to demonstrate backpressure eviction,
//! and reports the delivery counts.
//!
//! Usage:
//!   cargo run -- demo                      # Run with defaults
//!   cargo run -- demo --conns 100          # Run with 100 connections

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use pulse::event::UserId;
use pulse::{
    Connection, Event, EventKind, EventScope, HubBuilder, HubConfig, MetricsSink,
    PresenceListener, StaticMembership,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "demo" => {
            let shards = parse_flag(&args, "--shards").unwrap_or(4);
            let conns = parse_flag(&args, "--conns").unwrap_or(16);
            let events = parse_flag(&args, "--events").unwrap_or(32);
            run_demo(shards, conns, events).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Pulse - Sharded Real-Time Event Distribution Hub");
    println!();
    println!("USAGE:");
    println!("    cargo run -- demo [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    demo                Run the synthetic-load demo");
    println!("    help                Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --shards <NUM>      Number of shards (default: 4)");
    println!("    --conns <NUM>       Number of connections (default: 16)");
    println!("    --events <NUM>      Number of events to publish (default: 32)");
}

fn parse_flag(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|value| value.parse().ok())
}

/// Counts published events by kind
#[derive(Default)]
struct DemoMetrics {
    published: AtomicU64,
}

impl MetricsSink for DemoMetrics {
    fn increment_event(&self, _kind: &EventKind) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

/// Logs user-offline transitions
struct DemoPresence;

#[async_trait]
impl PresenceListener for DemoPresence {
    async fn user_went_offline(&self, user_id: UserId) {
        info!("user {} went offline", user_id);
    }
}

async fn run_demo(shards: usize, conns: usize, events: usize) -> anyhow::Result<()> {
    let config = HubConfig {
        shard_count: shards,
        ..Default::default()
    };
    let send_queue_size = config.send_queue_size;

    let membership = Arc::new(StaticMembership::new());
    let metrics = Arc::new(DemoMetrics::default());

    let mut registry = HubBuilder::new(config)
        .with_authorizer(Arc::clone(&membership) as _)
        .with_presence(Arc::new(DemoPresence))
        .with_metrics(Arc::clone(&metrics) as _)
        .build()?;

    info!(
        "demo: {} shards, {} connections, {} events",
        registry.shard_count(),
        conns,
        events
    );

    // Register healthy connections, each drained by its own consumer task.
    let delivered = Arc::new(AtomicU64::new(0));
    let mut connections = Vec::with_capacity(conns);
    for i in 0..conns {
        let user_id = format!("user-{}", i);
        membership.join_channel(&user_id, "town-square");

        let (connection, mut rx) = Connection::new(user_id, send_queue_size);
        connection.set_authenticated(true);
        registry.register(Arc::clone(&connection)).await;

        let delivered = Arc::clone(&delivered);
        tokio::spawn(async move {
            while let Some(_event) = rx.recv().await {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        });
        connections.push(connection);
    }

    // One connection with a single-slot queue that nobody drains; the hub
    // evicts it as soon as its queue overflows.
    membership.join_channel("stalled-user", "town-square");
    let (stalled, _stalled_rx) = Connection::new("stalled-user".to_string(), 1);
    stalled.set_authenticated(true);
    registry.register(Arc::clone(&stalled)).await;

    // Publish a burst of channel events.
    for seq in 0..events {
        let event = Event::new(
            EventKind::Posted,
            EventScope::Channel("town-square".to_string()),
        )
        .with_payload(json!({ "seq": seq }));
        registry.publish(event).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    info!(
        "published {} events, delivered {} (hellos included), {} connections still registered, stalled connection closed: {}",
        metrics.published.load(Ordering::Relaxed),
        delivered.load(Ordering::Relaxed),
        registry.total_connections(),
        stalled.is_closed()
    );

    for connection in connections {
        registry.unregister(connection).await;
    }
    registry.shutdown().await?;

    info!("demo finished");
    Ok(())
}
