// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqtap simulator
//!
//! Replays a JSON-lines file through the harness against the in-memory
//! broker and prints what was processed and how every delivery was settled.
//!
//! # Usage
//!
//! ```bash
//! # Wait for the order with id 7
//! mqtap-sim run --messages orders.jsonl --field id --equals 7
//!
//! # Same, with the processing callback failing
//! mqtap-sim run --messages orders.jsonl --field id --equals 7 --fail-processing
//!
//! # Using configuration file
//! mqtap-sim run --config mqtap.toml --messages orders.jsonl --field id --equals 7
//!
//! # Print the default configuration
//! mqtap-sim gen-config
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mqtap::{BrokerOperation, HarnessSettings, MemoryBroker, ProcessingCoordinator};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Message queue test harness simulator
#[derive(Parser, Debug)]
#[command(name = "mqtap-sim")]
#[command(about = "Replay messages through the mqtap harness against an in-memory broker")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for a message while replaying a JSON-lines file
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON-lines file, one message per line
        #[arg(short, long)]
        messages: PathBuf,

        /// Top-level field to match
        #[arg(short, long)]
        field: String,

        /// Expected value (JSON, or a plain string)
        #[arg(short, long)]
        equals: String,

        /// Override the configured timeout (milliseconds)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Make the processing callback fail
        #[arg(long)]
        fail_processing: bool,
    },

    /// Print the default configuration
    GenConfig,

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Commands::Run {
            config,
            messages,
            field,
            equals,
            timeout_ms,
            fail_processing,
        } => {
            let mut settings = load_settings(config.as_deref())?;
            if let Some(timeout_ms) = timeout_ms {
                settings = settings.with_timeout(Duration::from_millis(timeout_ms));
            }
            let lines = read_lines(&messages)?;
            cmd_run(settings, lines, field, expected_value(&equals), fail_processing).await
        }
        Commands::GenConfig => cmd_gen_config(),
        Commands::Validate { config } => cmd_validate(&config),
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<HarnessSettings> {
    match path {
        Some(path) => HarnessSettings::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(HarnessSettings::default()),
    }
}

fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// `7` and `true` compare as JSON; anything that does not parse is a string.
fn expected_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn cmd_run(
    settings: HarnessSettings,
    lines: Vec<String>,
    field: String,
    expected: Value,
    fail_processing: bool,
) -> anyhow::Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let harness = ProcessingCoordinator::new(
        "memory://mqtap-sim",
        broker.clone(),
        settings,
        move |message: Value| async move {
            if fail_processing {
                anyhow::bail!("processing rejected {}", message);
            }
            tracing::info!("processing {}", message);
            Ok(())
        },
    );

    println!("mqtap simulator v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();

    let description = format!("{} == {}", field, expected);
    let pending = harness
        .wait_for(description.clone(), move |message: &Value| {
            message.get(&field) == Some(&expected)
        })
        .await?;

    let published = broker.publish_all(lines.iter().map(String::as_str));
    println!(
        "Published {} message(s), {} delivered to the harness",
        published.len(),
        published.iter().flatten().count()
    );

    let outcome = pending.await;
    let cancel_wait = harness.settings().timeout();
    if tokio::time::timeout(cancel_wait, broker.cancellations(1))
        .await
        .is_err()
    {
        tracing::warn!("consumer was not cancelled within {:?}", cancel_wait);
    }

    println!();
    match &outcome {
        Ok(message) => println!("Matched `{}`: {}", description, message),
        Err(err) => println!("No result for `{}`:\n{}", description, err),
    }

    println!();
    println!("--- Broker Operations ---");
    for operation in broker.operations() {
        println!("  {}", format_operation(&operation));
    }
    println!();
    println!(
        "Acked: {:?}  Nacked: {:?}  Unsettled: {:?}  Backlog: {}",
        broker.acked(),
        broker.nacked(),
        broker.unsettled(),
        broker.backlog().len()
    );
    for violation in broker.violations() {
        println!("  violation: {}", violation);
    }

    harness.dispose();
    outcome.map(|_| ()).map_err(anyhow::Error::from)
}

fn format_operation(operation: &BrokerOperation) -> String {
    match operation {
        BrokerOperation::StartConsumer {
            consumer_tag,
            priority,
        } => format!("basic.consume {} (priority {})", consumer_tag, priority),
        BrokerOperation::Ack(tag) => format!("basic.ack {}", tag),
        BrokerOperation::Nack {
            delivery_tag,
            multiple,
        } => format!(
            "basic.nack {}{}",
            delivery_tag,
            if *multiple { " (multiple)" } else { "" }
        ),
        BrokerOperation::Cancel(tag) => format!("basic.cancel {}", tag),
        BrokerOperation::CancelConfirmed(tag) => format!("basic.cancel-ok {}", tag),
        BrokerOperation::Dispose => "channel.close".to_string(),
    }
}

fn cmd_gen_config() -> anyhow::Result<()> {
    let toml_str = HarnessSettings::default().to_toml()?;
    println!("# mqtap harness configuration");
    println!("# Generated by mqtap-sim gen-config");
    println!();
    print!("{}", toml_str);
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    match HarnessSettings::from_file(path) {
        Ok(settings) => {
            println!("Configuration valid!");
            println!();
            println!("Timeout:        {} ms", settings.timeout_ms);
            println!("Priority:       {}", settings.priority);
            println!("Prefetch count: {}", settings.prefetch_count);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
