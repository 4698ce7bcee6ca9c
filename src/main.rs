use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use classroom_mastery_engine::config::{load_config_from, AppConfig};
use classroom_mastery_engine::context::EngineContext;
use classroom_mastery_engine::db::{self, PgStore};
use classroom_mastery_engine::dispatch::{Dispatcher, JobHandle, JobStatus};
use classroom_mastery_engine::dkt::WeightOrigin;
use classroom_mastery_engine::models::{ResponsePayload, StudentRecord};
use classroom_mastery_engine::report;
use classroom_mastery_engine::store::SnapshotStore;

#[derive(Parser)]
#[command(name = "mastery-engine")]
#[command(about = "Hybrid mastery estimation and classroom analytics", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a realistic class with students and activity
    Seed,
    /// Import observations from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print the current mastery estimate for a student
    Estimate {
        #[arg(long)]
        email: String,
        #[arg(long)]
        concept: Option<String>,
    },
    /// Record a student response and update mastery
    Submit {
        #[arg(long)]
        email: String,
        #[arg(long)]
        correct: bool,
        #[arg(long)]
        response_time: Option<f64>,
        #[arg(long)]
        concept: Option<String>,
    },
    /// Record an engagement score (0-100)
    Engagement {
        #[arg(long)]
        email: String,
        #[arg(long)]
        score: f64,
    },
    /// Rebuild analytics snapshots
    Refresh {
        #[arg(long)]
        class: Option<String>,
    },
    /// Generate a markdown class dashboard
    Report {
        #[arg(long)]
        class: String,
        #[arg(long, default_value = "dashboard.md")]
        out: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("classroom_mastery_engine=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn require_student(pool: &sqlx::PgPool, email: &str) -> anyhow::Result<StudentRecord> {
    db::find_student_by_email(pool, email)
        .await?
        .with_context(|| format!("no student with email {email}"))
}

async fn require_class(pool: &sqlx::PgPool, name: &str) -> anyhow::Result<uuid::Uuid> {
    db::find_class_by_name(pool, name)
        .await?
        .with_context(|| format!("no class named {name}"))
}

fn print_status(student: &StudentRecord, status: &JobStatus) {
    match status.score {
        Some(score) => println!(
            "{} job for {} {}: score {:.1}{} after {} attempt(s)",
            status.kind,
            student.full_name,
            status.state,
            score,
            if status.degraded { " (degraded)" } else { "" },
            status.attempts
        ),
        None => println!(
            "{} job for {} {} after {} attempt(s){}",
            status.kind,
            student.full_name,
            status.state,
            status.attempts,
            status
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        ),
    }
}

/// Runs one job on a short-lived dispatcher and reports its terminal status.
async fn run_job(
    config: &AppConfig,
    ctx: Arc<EngineContext>,
    student: &StudentRecord,
    submit: impl FnOnce(&Dispatcher) -> anyhow::Result<JobHandle>,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::start(ctx, &config.dispatch);
    let handle = submit(&dispatcher)?;
    let status = dispatcher
        .wait(handle)
        .await
        .context("job status was dropped before completion")?;
    let pruned = dispatcher.prune_finished();
    tracing::debug!(pruned, "cleared finished jobs");
    dispatcher.shutdown().await;
    print_status(student, &status);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config_from(cli.config.as_deref())?;

    let database_url = config
        .database_url()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let ctx = Arc::new(EngineContext::from_config(&config.estimation, store.clone()));
    if let WeightOrigin::Fallback { seed } = ctx.engine.weight_origin() {
        tracing::debug!(seed, "sequence model running on fallback weights");
    }

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, &ctx.engine, config.estimation.history_limit).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let summary =
                db::import_csv(&pool, &ctx.engine, config.estimation.history_limit, &csv).await?;
            for student_id in &summary.students {
                ctx.snapshots.refresh(*student_id).await?;
            }
            println!(
                "Inserted {} observations ({} already present) from {}.",
                summary.inserted,
                summary.skipped,
                csv.display()
            );
        }
        Commands::Estimate { email, concept } => {
            let student = require_student(&pool, &email).await?;
            match ctx.current_estimate(student.id, concept.as_deref()).await? {
                Some(estimate) => {
                    let detail = estimate.estimate();
                    println!(
                        "{} ({}) mastery {:.1} via {}{}",
                        student.full_name,
                        student.email,
                        detail.score,
                        detail.method,
                        if estimate.is_degraded() { " (degraded)" } else { "" }
                    );
                }
                None => println!("No observations recorded for {}.", student.full_name),
            }
        }
        Commands::Submit {
            email,
            correct,
            response_time,
            concept,
        } => {
            let student = require_student(&pool, &email).await?;
            let payload = ResponsePayload {
                concept_id: concept,
                correct,
                response_time,
                occurred_at: Some(Utc::now()),
            };
            let student_id = student.id;
            run_job(&config, ctx, &student, |dispatcher| {
                Ok(dispatcher.submit_response(student_id, payload)?)
            })
            .await?;
        }
        Commands::Engagement { email, score } => {
            let student = require_student(&pool, &email).await?;
            let student_id = student.id;
            run_job(&config, ctx, &student, |dispatcher| {
                Ok(dispatcher.submit_engagement(student_id, score)?)
            })
            .await?;
        }
        Commands::Refresh { class } => match class {
            Some(name) => {
                let class_id = require_class(&pool, &name).await?;
                if ctx.snapshots.rebuild_class(class_id).await?.is_none() {
                    bail!("class {name} disappeared during refresh");
                }
                println!("Rebuilt snapshots for {name}.");
            }
            None => {
                let classes = ctx.snapshots.rebuild_all().await?;
                println!("Rebuilt snapshots for {classes} classes.");
            }
        },
        Commands::Report { class, out } => {
            let class_id = require_class(&pool, &class).await?;
            let dashboard = store
                .dashboard(class_id)
                .await?
                .with_context(|| format!("no class named {class}"))?;
            let markdown = report::build_dashboard(&dashboard, Utc::now());
            std::fs::write(&out, markdown)?;
            println!("Dashboard written to {}.", out.display());
        }
    }

    Ok(())
}
