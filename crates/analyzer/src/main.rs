//! AIOps analyzer CLI
//!
//! Runs the observability-to-remediation pipeline for one workload, or any
//! of its stages in isolation for inspection.
//!
//! Exit codes: 0 success, 2 run-fatal error, 3 decision made but its
//! notification failed (or spooled notifications remain undelivered).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::io::Read as _;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use analyzer::config::AnalyzerConfig;
use analyzer::decision::{self, DecisionOutcome};
use analyzer::dispatch::{DispatchReport, RedeliveryReport};
use analyzer::pending::PendingStore;
use analyzer::pipeline::{self, Pipeline, RunReport};
use analyzer::prompt::PromptBuilder;
use analyzer::target::{parse_selector_arg, Target};
use analyzer::AnalyzerError;

const DEFAULT_LOG_FILTER: &str = "aiops_analyzer=info,analyzer=info,notify=info";
const VERBOSE_LOG_FILTER: &str = "aiops_analyzer=debug,analyzer=debug,notify=debug";

const EXIT_FATAL: u8 = 2;
const EXIT_NOTIFICATION_FAILED: u8 = 3;

/// Observability-to-remediation analyzer - turns workload evidence into reviewable heal proposals
#[derive(Parser)]
#[command(name = "aiops-analyzer")]
#[command(about = "Observability-to-remediation analyzer - turns workload evidence into reviewable heal proposals")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON or YAML config file
    #[arg(long, global = true, env = "AIOPS_ANALYZER_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log format (text or json)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    Json,
    #[default]
    Text,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: evidence, decision, approval card
    Analyze {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Gather and print the evidence report only
    Evidence {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print the full request text without calling the reasoning service
    Prompt {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Parse and validate a saved reasoning-service response
    Parse {
        /// Response file, or - for stdin
        #[arg(long, default_value = "-")]
        file: String,
    },
    /// Re-send approval cards whose delivery failed
    Redeliver,
}

#[derive(Args)]
struct TargetArgs {
    /// YAML or JSON file holding `namespace` and a Kubernetes `selector`
    #[arg(long)]
    target_file: Option<PathBuf>,

    /// Target namespace (overrides the target file)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Equality label selector, e.g. app.kubernetes.io/name=order-service,tier=api
    #[arg(short = 'l', long)]
    selector: Option<String>,
}

impl TargetArgs {
    fn to_target(&self) -> Result<Target, AnalyzerError> {
        let mut target = match (&self.target_file, &self.selector) {
            (Some(path), None) => Target::from_file(path)?,
            (None, Some(selector)) => Target::new(
                self.namespace.clone().unwrap_or_default(),
                parse_selector_arg(selector)?,
            ),
            (Some(_), Some(_)) => {
                return Err(AnalyzerError::Resolution(
                    "use either --target-file or --selector, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(AnalyzerError::Resolution(
                    "a target needs --selector or --target-file".to_string(),
                ))
            }
        };
        if let Some(namespace) = &self.namespace {
            target.namespace.clone_from(namespace);
        }
        Ok(target)
    }
}

/// Machine-readable summary of one analysis run.
#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: String,
    namespace: &'a str,
    label_selector: &'a str,
    unavailable_sources: Vec<&'static str>,
    decision: &'a DecisionOutcome,
    notification: NotificationSummary<'a>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum NotificationSummary<'a> {
    Sent {
        request_id: &'a str,
        message_id: Option<&'a str>,
        expires_at: DateTime<Utc>,
    },
    Failed {
        request_id: &'a str,
        error: String,
        spooled: bool,
    },
    NotRequired,
}

impl<'a> RunSummary<'a> {
    fn new(report: &'a RunReport) -> Self {
        let notification = match &report.dispatch {
            DispatchReport::Notified { approval } => NotificationSummary::Sent {
                request_id: &approval.request_id,
                message_id: approval.message_id.as_deref(),
                expires_at: approval.expires_at,
            },
            DispatchReport::NotificationFailed {
                approval,
                error,
                spooled,
            } => NotificationSummary::Failed {
                request_id: &approval.request_id,
                error: error.to_string(),
                spooled: *spooled,
            },
            DispatchReport::Recorded { .. } => NotificationSummary::NotRequired,
        };

        Self {
            run_id: report.run_id.to_string(),
            namespace: &report.target.namespace,
            label_selector: &report.target.label_selector,
            unavailable_sources: report.evidence.unavailable_sections(),
            decision: &report.outcome,
            notification,
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match run(&cli, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Run failed");
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: &Cli, cancel: &CancellationToken) -> Result<ExitCode> {
    let load_config = || AnalyzerConfig::load(cli.config.as_deref());

    match &cli.command {
        Commands::Analyze { target } => {
            let config = load_config().await?;
            let target = target.to_target()?;
            let pipeline = Pipeline::from_config(&config, cancel).await?;
            let report = pipeline.run(&target, cancel).await?;
            print_run(&report, cli.format)?;
            if report.dispatch.delivery_failed() {
                return Ok(ExitCode::from(EXIT_NOTIFICATION_FAILED));
            }
        }
        Commands::Evidence { target } => {
            let config = load_config().await?;
            let resolved = target.to_target()?.resolve()?;
            let aggregator = pipeline::aggregator_from_config(&config).await;
            let evidence = aggregator.aggregate(&resolved, cancel).await?;
            print!("{evidence}");
        }
        Commands::Prompt { target } => {
            let config = load_config().await?;
            let resolved = target.to_target()?.resolve()?;
            let aggregator = pipeline::aggregator_from_config(&config).await;
            let evidence = aggregator.aggregate(&resolved, cancel).await?;
            let prompt = PromptBuilder::new(config.workload.clone())?;
            print!("{}", prompt.build(&resolved, &evidence, Utc::now())?);
        }
        Commands::Parse { file } => return parse_command(file, cli.format),
        Commands::Redeliver => {
            let config = load_config().await?;
            return redeliver_command(&config, cli.format, cancel).await;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_command(file: &str, format: OutputFormat) -> Result<ExitCode> {
    let raw = if file == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read response from stdin")?;
        raw
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?
    };

    let outcome = decision::parse(&raw)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print_outcome(&outcome),
    }
    Ok(ExitCode::SUCCESS)
}

async fn redeliver_command(
    config: &AnalyzerConfig,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    config.validate_notification()?;
    let store = PendingStore::new(&config.pending_dir);
    let dispatcher = pipeline::dispatcher_from_config(config);
    let RedeliveryReport {
        delivered,
        remaining,
    } = dispatcher.redeliver(&store, Utc::now(), cancel).await?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "delivered": delivered,
                "remaining": remaining,
            }))?
        ),
        OutputFormat::Text => {
            for approval in &delivered {
                println!(
                    "  {} {} (expires {})",
                    "✓".green(),
                    approval.request_id,
                    approval.expires_at.to_rfc3339()
                );
            }
            for id in &remaining {
                println!("  {} {id}", "✗".red());
            }
            println!(
                "{} delivered, {} remaining",
                delivered.len(),
                remaining.len()
            );
        }
    }

    Ok(if remaining.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_NOTIFICATION_FAILED)
    })
}

fn print_run(report: &RunReport, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&RunSummary::new(report))?);
        return Ok(());
    }

    println!("{} {}", "Run:".bold(), report.run_id);
    println!(
        "{} {} ({})",
        "Target:".bold(),
        report.target.label_selector,
        report.target.namespace
    );
    let unavailable = report.evidence.unavailable_sections();
    if !unavailable.is_empty() {
        println!(
            "{}",
            format!("Evidence sources unavailable: {}", unavailable.join(", ")).yellow()
        );
    }
    print_outcome(&report.outcome);

    match &report.dispatch {
        DispatchReport::Notified { approval } => println!(
            "{}",
            format!(
                "✓ Approval card sent: {} (expires {})",
                approval.request_id, approval.expires_at
            )
            .green()
        ),
        DispatchReport::NotificationFailed {
            approval,
            error,
            spooled,
        } => {
            println!(
                "{}",
                format!("✗ Approval card not delivered: {error}").red()
            );
            if *spooled {
                println!("  Saved {} for redelivery", approval.request_id);
            }
        }
        DispatchReport::Recorded { .. } => {}
    }
    Ok(())
}

fn print_outcome(outcome: &DecisionOutcome) {
    match outcome {
        DecisionOutcome::Noop(noop) => {
            println!("{} {}", "No action:".green().bold(), noop.reason);
        }
        DecisionOutcome::Heal(heal) => {
            let risk = match heal.risk_level {
                decision::RiskLevel::Low => heal.risk_level.as_str().green(),
                decision::RiskLevel::Medium => heal.risk_level.as_str().yellow(),
                decision::RiskLevel::High => heal.risk_level.as_str().red(),
            };
            println!("{} {}", "Heal proposed:".yellow().bold(), heal.reason);
            println!(
                "  {} {} {}",
                heal.target.kind, heal.target.label_selector, heal.namespace
            );
            println!("  risk: {risk}  patch: {}", heal.patch_file_name);
            for op in &heal.patch_operations {
                println!("    {op}");
            }
        }
    }
}
