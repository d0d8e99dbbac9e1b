//! # captrace
//!
//! Composition root and operator CLI for the captrace document pipeline.
//!
//! The binary wires the external capabilities together - Postgres,
//! the OpenAI-backed LLM client, the pgvector index, the real filesystem -
//! and either runs the watching pipeline (`run`) or drives one-shot
//! operator actions (`process`, `rescan`, `reconcile`, `status`, `reset`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use captrace_config::{Settings, SettingsSource};
use captrace_core::fs::TokioFs;
use captrace_core::llm::{OpenAiLlm, RateLimitedLlm};
use captrace_core::vector::{OpenAiEmbeddings, PgVectorIndex};
use captrace_core::Engine;
use captrace_model::{FundId, ReconciliationType};

#[derive(Parser, Debug)]
#[command(name = "captrace", about = "PE document ingestion pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the watching pipeline until interrupted.
    Run,
    /// Process a single file and report the outcome.
    Process {
        file: PathBuf,
        /// Investor code owning the file; inferred from the roots when
        /// omitted.
        #[arg(long)]
        investor: Option<String>,
        /// Reprocess even when the document already exists.
        #[arg(long)]
        force: bool,
    },
    /// Sweep the configured roots (or one of them) for unseen files.
    Rescan {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Run reconciliation for a fund and reporting date.
    Reconcile {
        fund: Uuid,
        /// Reporting date, ISO (YYYY-MM-DD).
        as_of: NaiveDate,
        /// Comma-separated subset of nav,cashflow,performance,commitment.
        #[arg(long)]
        scope: Option<String>,
    },
    /// Print ledger states, queue depth, and counters.
    Status,
    /// Reset a failed ledger entry back to queued.
    Reset { content_hash: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let cli = Cli::parse();

    let (settings, source) = Settings::load_from_env()?;
    match &source {
        SettingsSource::Default => info!("using default settings"),
        SettingsSource::EnvPath(path) => info!(path = %path.display(), "settings loaded"),
        SettingsSource::EnvInline => info!("settings loaded from inline JSON"),
        SettingsSource::File(path) => info!(path = %path.display(), "settings loaded"),
    }
    settings.validate().context("invalid settings")?;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .after_connect(|conn, _meta| {
            // The schema stores timestamptz; keep every session in UTC.
            Box::pin(async move {
                conn.execute("SET TIME ZONE 'UTC'").await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;

    Engine::migrate(&pool).await?;

    let llm = Arc::new(RateLimitedLlm::new(
        OpenAiLlm::from_env(
            settings.llm.model.clone(),
            Duration::from_secs(settings.llm.classify_timeout_secs),
            Duration::from_secs(settings.llm.extract_timeout_secs),
        ),
        settings.llm.concurrency,
        settings.llm.rate_per_minute,
    ));
    let embeddings = Arc::new(OpenAiEmbeddings::from_env());
    let vector = Arc::new(PgVectorIndex::new(pool.clone(), embeddings));
    let fs = Arc::new(TokioFs::new());

    let engine = Engine::start(settings, pool, llm, vector, fs).await?;

    match cli.command {
        Command::Run => {
            info!("pipeline running; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            engine.shutdown();
            // Give in-flight stages a moment to requeue cleanly.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Command::Process {
            file,
            investor,
            force,
        } => {
            let result = engine
                .process_file(&file, investor.as_deref(), force)
                .await?;
            println!(
                "doc_id: {}",
                result
                    .doc_id
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into())
            );
            println!("status: {}", result.status.as_str());
            println!("confidence: {:.3}", result.confidence);
            println!("findings: {}", result.findings_count);
            engine.shutdown();
        }
        Command::Rescan { root } => {
            let stats = engine.rescan(root.as_deref()).await?;
            println!("queued: {}", stats.queued);
            println!("skipped: {}", stats.skipped);
            engine.shutdown();
        }
        Command::Reconcile { fund, as_of, scope } => {
            let scope = parse_scope(scope.as_deref())?;
            match engine.reconcile(FundId(fund), as_of, &scope).await? {
                Some(run) => {
                    println!(
                        "overall: {} ({})",
                        run.overall_status.as_str(),
                        run.overall_severity.as_str()
                    );
                    for finding in &run.findings {
                        println!(
                            "- {}: {} [{}]",
                            finding.reconciliation_type.as_str(),
                            finding.status.as_str(),
                            finding.severity.as_str()
                        );
                        for rec in &finding.recommendations {
                            println!("    {rec}");
                        }
                    }
                    if run.needs_review {
                        println!("operator review requested");
                    }
                }
                None => println!("a run for this fund and date is already in flight"),
            }
            engine.shutdown();
        }
        Command::Status => {
            let status = engine.status();
            println!("ledger:");
            for (state, count) in &status.ledger_states {
                println!("  {state}: {count}");
            }
            println!("queue_depth: {}", status.queue_depth);
            println!("busy_workers: {}", status.busy_workers);
            println!("backlog: {}", status.backlog);
            println!("counters:");
            for (name, value) in &status.counters {
                println!("  {name}: {value}");
            }
            engine.shutdown();
        }
        Command::Reset { content_hash } => {
            engine.reset(&content_hash)?;
            println!("reset: {content_hash}");
            engine.shutdown();
        }
    }

    Ok(())
}

fn parse_scope(raw: Option<&str>) -> anyhow::Result<Vec<ReconciliationType>> {
    let Some(raw) = raw else { return Ok(Vec::new()) };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            ReconciliationType::parse(s)
                .ok_or_else(|| anyhow::anyhow!("unknown reconciliation type {s:?}"))
        })
        .collect()
}
