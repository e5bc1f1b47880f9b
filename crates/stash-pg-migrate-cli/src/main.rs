//! stash-pg-migrate CLI - copy a stash SQLite database into PostgreSQL.

use clap::{Parser, Subcommand};
use stash_pg_migrate::{Config, MigrateError, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "stash-pg-migrate")]
#[command(about = "Migrate a stash SQLite database into PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PostgreSQL connection string (prompted for when absent)
    #[arg(long)]
    target: Option<String>,

    /// Path to the SQLite database (prompted for when absent)
    #[arg(long)]
    source: Option<String>,

    /// Rows per page
    #[arg(long)]
    page_size: Option<usize>,

    /// Read the next page while the current one is written
    #[arg(long)]
    read_ahead: bool,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Migrate every table and reset sequences (default)
    Run,

    /// Compare row counts between source and target
    Validate,

    /// Test both database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::default(),
    };
    apply_overrides(&cli, &mut config);
    prompt_missing(&mut config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.run().await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("Migration successful!");
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!(
                    "  Tables: {} ({} skipped)",
                    result.tables_total, result.tables_skipped
                );
                println!("  Rows: {}", result.rows_transferred);
                if result.rows_dropped > 0 {
                    println!("  Dropped rows: {}", result.rows_dropped);
                }
                println!("  Throughput: {} rows/sec", result.rows_per_second);
            }
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config).await?;
            let report = orchestrator.validate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            report.into_result()?;
            if !cli.output_json {
                println!("Validation completed successfully");
            }
        }

        Commands::HealthCheck => {
            let result = Orchestrator::health_check(&config).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (SQLite): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::connection(
                    "health check",
                    "one or more stores are unreachable",
                ));
            }
        }
    }

    Ok(())
}

fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(url) = &cli.target {
        config.target.url = url.clone();
    }
    if let Some(path) = &cli.source {
        config.source.path = path.clone();
    }
    if let Some(size) = cli.page_size {
        config.migration.page_size = size;
    }
    if cli.read_ahead {
        config.migration.read_ahead = true;
    }
}

/// Ask for the destination and then the source on stdin, one line each,
/// when neither flags nor the config file provided them.
async fn prompt_missing(config: &mut Config) -> Result<(), MigrateError> {
    if !config.target.url.is_empty() && !config.source.path.is_empty() {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if config.target.url.is_empty() {
        config.target.url = prompt(&mut lines, "postgres connector: ").await?;
    }
    if config.source.path.is_empty() {
        config.source.path = prompt(&mut lines, "sqlite db path: ").await?;
    }
    Ok(())
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<String, MigrateError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;

    match lines.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => Err(MigrateError::Config(format!(
            "no value given for '{}'",
            label.trim_end_matches([':', ' '])
        ))),
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
