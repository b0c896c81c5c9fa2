//! vigil command-line interface.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use vigil::config::PipelineConfig;
use vigil::gate::GateStatus;
use vigil::model::HttpTransport;
use vigil::orchestrator::Orchestrator;
use vigil::store::JsonFileStore;

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Structural vulnerability analysis pipeline")]
struct Cli {
    /// Path to a config file (overrides VIGIL_CONFIG and ./vigil.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the bundled starter corpus, taxonomy, and policies.
    Seed,
    /// Run the pipeline, or a single stage of it.
    Run {
        /// Run only this stage number.
        #[arg(long)]
        stage: Option<u32>,
    },
    /// Show the latest run's stage and gate status.
    Status,
    /// Approve a pending gate proposal, entirely or a subset of it.
    Approve {
        /// The gated stage.
        #[arg(long)]
        stage: u32,
        /// Comma-separated item ids; omit to approve everything.
        #[arg(long, value_delimiter = ',')]
        items: Option<Vec<String>>,
    },
    /// Reject a pending gate proposal.
    Reject {
        /// The gated stage.
        #[arg(long)]
        stage: u32,
    },
    /// Cancel the latest run.
    Cancel,
    /// Export the latest run's results.
    Export {
        /// Output format.
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Markdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::resolve(cli.config.as_deref()).context("resolving config")?;

    let store = Arc::new(
        JsonFileStore::open(&config.pipeline.store_path).context("opening entity store")?,
    );
    let transport = Arc::new(HttpTransport::new(&config.model).context("building transport")?);
    let export_dir = config.pipeline.export_dir.clone();
    let gated_stages = config.pipeline.human_gates.clone();
    let orchestrator = Orchestrator::new(store, transport, config);

    match cli.command {
        Command::Seed => {
            let run = orchestrator.ensure_run("seed").await?;
            let loaded = orchestrator.seed(&run.run_id).await?;
            println!("seeded {loaded} documents into run {}", run.run_id);
        }
        Command::Run { stage } => {
            let run = orchestrator.ensure_run("cli run").await?;
            match stage {
                Some(stage) => {
                    let report = orchestrator.run_stage(&run.run_id, stage).await?;
                    println!(
                        "stage {stage}: processed {} skipped {} failed {}",
                        report.items_processed,
                        report.skipped,
                        report.item_errors.len()
                    );
                }
                None => {
                    let summary = orchestrator.run_all(&run.run_id).await?;
                    for (number, report) in &summary.reports {
                        println!(
                            "stage {number}: processed {} skipped {} failed {}",
                            report.items_processed,
                            report.skipped,
                            report.item_errors.len()
                        );
                    }
                    match summary.halted_at_gate {
                        Some(stage) => println!(
                            "halted at stage {stage} gate; review with `vigil status`, then \
                             `vigil approve --stage {stage}` or `vigil reject --stage {stage}`"
                        ),
                        None => println!("run {} completed", summary.run_id),
                    }
                }
            }
        }
        Command::Status => {
            let run = orchestrator.latest_run().await?;
            let report = orchestrator.status(&run.run_id).await?;
            println!("run {} [{}]", report.run.run_id, report.run.state);
            for line in report.stages {
                let status = line
                    .status
                    .map_or_else(|| "-".to_string(), |s| s.to_string());
                print!(
                    "  {} {:<14} {:<18} items={}",
                    line.stage, line.name, status, line.items_processed
                );
                if let Some(error) = &line.error {
                    print!("  error: {error}");
                }
                if let Some(gate) = line.gate {
                    match gate {
                        GateStatus::AwaitingApproval { items } => {
                            print!("  gate: {items} item(s) awaiting approval");
                        }
                        GateStatus::Approved => print!("  gate: approved"),
                        GateStatus::Rejected => print!("  gate: rejected"),
                        GateStatus::NotReached => print!("  gate: not reached"),
                    }
                }
                println!();
            }
            for &stage in &gated_stages {
                if let Some(proposal) = orchestrator.gate().pending(&run.run_id, stage).await? {
                    println!("pending at stage {stage}:");
                    for item in proposal.items {
                        println!("  {}  {}", item.item_id, item.label);
                    }
                }
            }
        }
        Command::Approve { stage, items } => {
            let run = orchestrator.latest_run().await?;
            let resolution = orchestrator
                .gate()
                .approve(&run.run_id, stage, items.as_deref())
                .await?;
            println!(
                "approved {} item(s), discarded {}; rerun `vigil run` to continue",
                resolution.approved, resolution.discarded
            );
        }
        Command::Reject { stage } => {
            let run = orchestrator.latest_run().await?;
            orchestrator.gate().reject(&run.run_id, stage).await?;
            println!("rejected stage {stage} proposal; rerun `vigil run` to regenerate");
        }
        Command::Cancel => {
            let run = orchestrator.latest_run().await?;
            orchestrator.cancel(&run.run_id).await?;
            println!("cancelled run {}", run.run_id);
        }
        Command::Export { format } => {
            let run = orchestrator.latest_run().await?;
            let path = match format {
                ExportFormat::Json => {
                    orchestrator.export_json(&run.run_id, &export_dir).await?
                }
                ExportFormat::Markdown => {
                    orchestrator.export_markdown(&run.run_id, &export_dir).await?
                }
            };
            println!("exported to {}", path.display());
        }
    }

    Ok(())
}
