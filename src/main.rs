use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::{AdminApi, EngineConfig, Kernel};
use gatehouse_audit_center::AuditFilter;
use gatehouse_core_types::{ActionType, TierLevel};
use gatehouse_orchestrator::{SubmitRequest, TaskStatus};

#[derive(Parser)]
#[command(name = "gatehouse", version, about = "Tiered authorization and multi-agent orchestration engine")]
struct Cli {
    /// Path to the engine configuration file (YAML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted.
    Serve,
    /// Run a self-contained demo flow against an in-memory engine.
    Demo,
    /// Print the effective policy snapshot.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Audit log utilities.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Dump tiers and tenants as YAML.
    Show,
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Print the most recent audit events as JSON lines.
    Tail {
        #[arg(long, default_value_t = 50)]
        count: usize,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Demo => demo(config).await,
        Command::Policy {
            command: PolicyCommand::Show,
        } => policy_show(config).await,
        Command::Audit {
            command: AuditCommand::Tail { count },
        } => audit_tail(config, count).await,
    }
}

async fn serve(config: EngineConfig) -> anyhow::Result<()> {
    let kernel = Kernel::bootstrap(config).await?;
    kernel.start().await;
    info!("gatehouse engine running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    kernel.shutdown().await;
    info!("gatehouse engine stopped");
    Ok(())
}

async fn demo(mut config: EngineConfig) -> anyhow::Result<()> {
    config.data_dir = None;
    config.scheduler.tick_ms = 50;
    let kernel = Kernel::bootstrap(config).await?;
    kernel.start().await;
    let admin = AdminApi::new(Arc::clone(&kernel));

    let tenant = admin.create_tenant("demo-tenant", TierLevel::Standard).await?;
    let (human, _) = admin.issue_human(tenant.id.clone(), TierLevel::Standard).await?;
    println!("issued human actor {} in tenant {}", human.id, tenant.id);

    let chat = kernel
        .orchestrator
        .submit(SubmitRequest::new(
            human.id.clone(),
            ActionType::ChatReply,
            json!({ "message": "summarize today's schedule" }),
        ))
        .await?;
    println!("submitted chat task {}", chat.id);

    let (agent, _) = admin
        .issue_agent(
            &human.id,
            HashSet::from([ActionType::CodeReview]),
            Duration::from_secs(3600),
        )
        .await?;
    let review = kernel
        .orchestrator
        .submit(SubmitRequest::new(
            agent.id.clone(),
            ActionType::CodeReview,
            json!({ "diff": "fn main() {}" }),
        ))
        .await?;
    println!("issued agent {} and submitted review task {}", agent.id, review.id);

    // A denial surfaces a specific reason, never a generic forbidden.
    match kernel
        .orchestrator
        .submit(SubmitRequest::new(
            human.id.clone(),
            ActionType::PortalScrape,
            json!({}),
        ))
        .await
    {
        Ok(_) => println!("unexpected allow"),
        Err(err) => println!("denied as expected: {err}"),
    }

    for task in [&chat.id, &review.id] {
        for _ in 0..200 {
            let status = kernel
                .orchestrator
                .task(task)
                .map(|record| record.status)
                .unwrap_or(TaskStatus::Failed);
            if status.is_terminal() {
                println!("task {task} finished as {status:?}");
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    let denials = admin
        .audit_query(&AuditFilter {
            kinds: Some(vec![gatehouse_audit_center::AuditKind::DecisionDenied]),
            ..AuditFilter::default()
        })
        .await?;
    println!("audit recorded {} denial(s)", denials.len());
    print!("{}", gatehouse::metrics::gather());

    kernel.shutdown().await;
    Ok(())
}

async fn policy_show(config: EngineConfig) -> anyhow::Result<()> {
    let kernel = Kernel::bootstrap(config).await?;
    let admin = AdminApi::new(Arc::clone(&kernel));
    let snapshot = admin.policy_snapshot().await?;
    let rendered = serde_yaml::to_string(snapshot.as_ref())?;
    println!("{rendered}");
    kernel.shutdown().await;
    Ok(())
}

async fn audit_tail(config: EngineConfig, count: usize) -> anyhow::Result<()> {
    let kernel = Kernel::bootstrap(config).await?;
    let admin = AdminApi::new(Arc::clone(&kernel));
    let events = admin
        .audit_query(&AuditFilter {
            limit: Some(count),
            ..AuditFilter::default()
        })
        .await?;
    for event in events.iter().rev().take(count) {
        println!("{}", serde_json::to_string(event)?);
    }
    kernel.shutdown().await;
    Ok(())
}
