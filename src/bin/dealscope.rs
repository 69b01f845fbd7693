use anyhow::Context;
use clap::{Parser, Subcommand};
use dealscope::alerts::ChannelSink;
use dealscope::config::EngineConfig;
use dealscope::patterns::Pattern;
use dealscope::recommend::RuleBasedRecommender;
use dealscope::scheduler::{spawn_maintenance, EventSource, PendingEvent, Scheduler, SchedulerHandle};
use dealscope::service::{Engine, MemorySource, ServiceError};
use dealscope::store::MemoryStore;
use dealscope::summary::{summarize_records, AnalysisOutput};
use dealscope::webhook::WebhookFilter;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

fn init_parallelism() {
    static START: Once = Once::new();
    START.call_once(|| {
        let n = num_cpus::get();
        let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
    });
}

fn init_logging() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    // stdout carries JSON output only
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(io::stderr)).try_init();
}

#[derive(Parser, Debug)]
#[command(name = "dealscope", version, about = "Workflow pattern mining and pipeline change alerts")]
struct Cli {
    /// TOML configuration file; DEALSCOPE_* variables override it.
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-shot pattern analysis over a JSON array or JSON lines of workflow records
    Analyze {
        /// Input file (`-` for stdin)
        #[arg(default_value = "-")]
        input: String,
        /// Output format: json | table
        #[arg(long = "format", default_value = "json")]
        format: String,
    },
    /// Long-running service reading snapshot/webhook/trigger/status lines from stdin
    Watch {
        /// Persisted learning state (overrides state_path from config)
        #[arg(long = "state")]
        state: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InputLine {
    Snapshot { organization_id: String, workflows: Vec<Value> },
    Webhook { organization_id: String, notifications: Vec<Value> },
    Trigger { organization_id: String, #[serde(default)] reason: String },
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_parallelism();
    init_logging();
    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Analyze { input, format } => {
            let records = read_records(&input)?;
            let out = summarize_records(&records, &config);
            match format.as_str() {
                "table" => print_patterns_table(&out),
                _ => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Command::Watch { state } => {
            if state.is_some() {
                config.state_path = state;
            }
            run_watch(config).await?;
        }
    }
    Ok(())
}

/// Records as a JSON array, or one JSON object per line. Unparsable lines
/// are kept as nulls so they are reported with their position.
fn read_records(path: &str) -> anyhow::Result<Vec<Value>> {
    let mut raw = String::new();
    if path == "-" {
        io::stdin().read_to_string(&mut raw)?;
    } else {
        raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    }
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(&raw).context("parsing JSON array");
    }
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap_or(Value::Null))
        .collect())
}

fn print_patterns_table(out: &AnalysisOutput) {
    let s = &out.summary;
    println!(
        "records={} workflows={} patterns={} clustered={} unclustered={} errors={}",
        s.total_records, s.valid_workflows, s.patterns, s.clustered, s.unclustered, out.errors.total
    );
    let mut pats: Vec<&Pattern> = out.patterns.iter().collect();
    pats.sort_by(|a, b| {
        b.size()
            .cmp(&a.size())
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.id.cmp(&b.id))
    });
    println!("{:<6} {:<10} {:<8} {:<8} {:<10} {:<24} {}", "Size", "Confidence", "Cycle", "Success", "Efficiency", "Bottlenecks", "Pattern");
    for p in pats {
        let bottlenecks = p.bottlenecks.iter().map(|b| format!("{}@{}", b.severity, b.location)).join(",");
        println!(
            "{:<6} {:<10.3} {:<8.1} {:<8.2} {:<10.3} {:<24} {}",
            p.size(),
            p.confidence,
            p.benchmarks.avg_cycle_days,
            p.benchmarks.success_rate,
            p.benchmarks.efficiency,
            if bottlenecks.is_empty() { "-".to_string() } else { bottlenecks },
            p.id
        );
    }
}

fn emit<T: Serialize>(kind: &str, body: &T) {
    let mut v = serde_json::to_value(body).unwrap_or(Value::Null);
    match v.as_object_mut() {
        Some(obj) => {
            obj.insert("kind".to_string(), Value::String(kind.to_string()));
        }
        None => v = serde_json::json!({ "kind": kind, "value": v }),
    }
    println!("{v}");
}

fn handle_line(line: &str, handle: &SchedulerHandle, source: &MemorySource, filter: &WebhookFilter) {
    let input: InputLine = match serde_json::from_str(line) {
        Ok(i) => i,
        Err(e) => {
            emit("error", &ServiceError::invalid(format!("unreadable input line: {e}")));
            return;
        }
    };
    let now = chrono::Utc::now();
    let result = match input {
        InputLine::Snapshot { organization_id, workflows } => {
            source.set(&organization_id, workflows);
            handle.submit(PendingEvent { organization_id, source: EventSource::Snapshot, received_at: now })
        }
        InputLine::Webhook { organization_id, notifications } => {
            let ingested = filter.ingest(&organization_id, &notifications, now);
            emit(
                "webhook_ack",
                &serde_json::json!({
                    "organization_id": organization_id,
                    "accepted": ingested.accepted.len(),
                    "skipped_malformed": ingested.skipped_malformed,
                    "dropped_irrelevant": ingested.dropped_irrelevant,
                }),
            );
            ingested.accepted.into_iter().try_for_each(|e| handle.submit(e))
        }
        InputLine::Trigger { organization_id, reason } => {
            handle.trigger(&organization_id, &reason).map(|ack| emit("trigger_ack", &ack))
        }
        InputLine::Status => {
            emit("status", &handle.status());
            Ok(())
        }
    };
    if let Err(e) = result {
        emit("error", &e);
    }
}

async fn run_watch(config: EngineConfig) -> anyhow::Result<()> {
    let source = Arc::new(MemorySource::new());
    let (sink, mut alerts) = ChannelSink::new();
    let filter = WebhookFilter::from(&config.webhook);
    let debounce = config.scheduler.debounce();
    let reanalysis = config.scheduler.reanalysis_interval();
    let engine = Arc::new(Engine::new(
        config,
        Arc::new(MemoryStore::new()),
        source.clone(),
        Arc::new(RuleBasedRecommender),
        Arc::new(sink),
    ));
    let restored = engine.restore();
    info!(organizations = restored, "watch started");

    let handle = Scheduler::spawn(engine.clone(), debounce);
    let maintenance = spawn_maintenance(engine.clone(), reanalysis);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    }) {
        warn!(error = %e, "cannot install Ctrl-C handler");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => handle_line(&line, &handle, &source, &filter),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            },
            Some(alert) = alerts.recv() => emit("alert", &alert),
            Ok(()) = stop_rx.changed() => break,
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    maintenance.shutdown().await;
    while let Ok(alert) = alerts.try_recv() {
        emit("alert", &alert);
    }
    if let Err(e) = engine.persist() {
        emit("error", &e);
    }
    Ok(())
}
