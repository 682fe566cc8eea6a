use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use chainsaw_logs::{
    Capacity, DispatchQueue, EventStore, LineParser, PipelineConfig, StoreRegistry, StoreStatus,
};
use chainsaw_rules::{AndRule, LevelRule, PartialTextRule, RuleRef};
use chainsaw_types::LogLevel;

/// Chainsaw - route log lines into per-destination buffers and summarise them
#[derive(Parser, Debug)]
#[command(name = "chainsaw")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log file to read (stdin when omitted)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Records retained per destination
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Retain every record
    #[arg(long, conflicts_with = "buffer_size")]
    unbounded: bool,

    /// Pause between dispatch cycles in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Routing expression, e.g. "PROP.hostname - PROP.application"
    #[arg(long, value_name = "EXPR")]
    route: Option<String>,

    /// Only show records at or above this level
    #[arg(long, value_name = "LEVEL")]
    min_level: Option<String>,

    /// Only show records containing this text
    #[arg(long, value_name = "TEXT")]
    grep: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let mut store_config = config.store_config()?;
    if args.unbounded {
        store_config.capacity = Capacity::Unbounded;
    } else if let Some(size) = args.buffer_size {
        store_config.capacity =
            Capacity::bounded(size).context("Buffer size must be a positive integer")?;
    }

    let mut dispatch_config = config.dispatch_config()?;
    if let Some(interval) = args.interval_ms {
        dispatch_config.interval = Duration::from_millis(interval);
    }
    if let Some(route) = &args.route {
        dispatch_config.routing_expression = Some(route.clone());
    }
    if dispatch_config.routing_expression.is_none() {
        anyhow::bail!("No routing expression configured");
    }

    let registry = Arc::new(StoreRegistry::new(store_config));
    registry.set_display_rule(display_rule(&args)?);
    registry.on_store_created().subscribe(watch_capacity);

    let queue = DispatchQueue::new(dispatch_config);
    queue.add_consumer(registry.clone());

    let (count, source) = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let source = path.display().to_string();
            (ingest(BufReader::new(file), &source, &queue).await?, source)
        }
        None => (
            ingest(BufReader::new(tokio::io::stdin()), "stdin", &queue).await?,
            "stdin".to_string(),
        ),
    };
    tracing::info!(count, %source, "input finished");

    // Let the worker drain what is left, then stop it
    while queue.pending_len() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.join().await;

    print_summary(&registry, count, queue.data_rate());
    Ok(())
}

/// Feed every line of `reader` into the queue, returning the line count
async fn ingest<R>(reader: R, source: &str, queue: &DispatchQueue) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        if line.trim().is_empty() {
            continue;
        }
        queue.enqueue(Arc::new(LineParser::parse(&line, source)));
        count += 1;
    }
    Ok(count)
}

fn display_rule(args: &Args) -> Result<Option<RuleRef>> {
    let mut rules: Vec<RuleRef> = Vec::new();
    if let Some(level) = &args.min_level {
        rules.push(Arc::new(LevelRule::new(">=", level)?));
    }
    if let Some(text) = &args.grep {
        rules.push(Arc::new(PartialTextRule::new(text)));
    }
    Ok(match rules.len() {
        0 => None,
        1 => rules.pop(),
        _ => Some(Arc::new(AndRule::new(rules))),
    })
}

fn watch_capacity(store: &EventStore) {
    let name = store.name().to_string();
    store.events().status.subscribe(move |status| {
        if let StoreStatus::CapacityThreshold {
            threshold,
            size,
            capacity,
        } = status
        {
            eprintln!(
                "{}: buffer at {:.0}% ({}/{})",
                name,
                threshold * 100.0,
                size,
                capacity
            );
        }
    });
}

fn print_summary(registry: &StoreRegistry, count: usize, rate: f64) {
    println!("{} lines read, last rate {:.1} records/s", count, rate);
    for store in registry.stores() {
        let counts = store.counts();
        let levels = store.level_counts();
        let breakdown: Vec<String> = LogLevel::ALL
            .iter()
            .filter(|level| levels.get(**level) > 0)
            .map(|level| format!("{}={}", level.as_str(), levels.get(*level)))
            .collect();
        println!(
            "{:<32} {:>7} shown / {:>7} kept  {}",
            store.name(),
            counts.visible,
            counts.total,
            breakdown.join(" ")
        );
    }
}
