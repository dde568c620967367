use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ringrate::config::AppConfig;
use ringrate::ratelimit::RateLimitEngine;
use ringrate::store::RedisStore;

/// Record and inspect sliding-window hit rates stored in Redis.
#[derive(Parser, Debug)]
#[command(name = "ringrate", version)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); RINGRATE__* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one hit for each subject at the current time
    Add {
        #[arg(required = true)]
        subjects: Vec<String>,
    },
    /// Show the window counters for a subject
    Count { subject: String },
    /// Show every rate estimate for a subject
    Rate {
        subject: String,
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = AppConfig::load(cli.config.as_deref())?;
    info!(
        action = %config.window.action,
        redis_url = %config.store.redis_url,
        "Configuration loaded"
    );

    let store = Arc::new(RedisStore::connect(&config.store.redis_url).await?);
    let engine = RateLimitEngine::new(store, &config.window)?;

    match cli.command {
        Command::Add { subjects } => {
            let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let results = engine.add_all(now, &subjects).await;

            let mut failed = 0;
            for (subject, result) in subjects.iter().zip(results) {
                if let Err(e) = result {
                    error!(subject = %subject, error = %e, "Failed to record hit");
                    failed += 1;
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} hits were not recorded", failed, subjects.len());
            }
        }
        Command::Count { subject } => {
            let aggregate = engine.count_now(&subject).await?;
            println!("sum:                 {}", aggregate.sum);
            println!("peak_count:          {}", aggregate.peak_count);
            println!("latest_bucket_count: {}", aggregate.latest_bucket_count);
            println!("empty_buckets:       {}", aggregate.number_of_empty_buckets);
        }
        Command::Rate { subject, json } => {
            let snapshot = engine.rate_now(&subject).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("average:                {:.3}", snapshot.average_rate);
                println!(
                    "average_non_empty:      {:.3}",
                    snapshot.average_rate_excluding_empty_buckets
                );
                println!("peak:                   {:.3}", snapshot.peak_rate);
                println!("latest_bucket:          {:.3}", snapshot.latest_bucket_rate);
                println!(
                    "selected ({:?}): {:.3}",
                    engine.selected_estimator(),
                    snapshot.select(engine.selected_estimator())
                );
            }
        }
    }

    Ok(())
}

/// Install the global subscriber. Logs go to stderr so command output stays
/// clean on stdout.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
