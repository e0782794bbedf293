//! droptest CLI
//!
//! Command-line interface for the bottle drop test analysis engine.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Instrument};

mod validator;
mod workspace;

use dt_core::predictor::TrainingOptions;
use dt_core::{
    spawn_archive_consumer, AdaptationError, AdaptationReport, AnalysisEngine, Decision,
    EngineConfig, LogisticModel, ModelSlot, ParameterStore, PerformanceStats, SampleStore,
    ThresholdAdapter, TrainingCollector, Verdict,
};
use dt_observability::{decision_span, LoggingConfig};
use validator::{ConfigValidator, ValidationResult};
use workspace::{read_measurements, Workspace};

#[derive(Parser)]
#[command(name = "droptest")]
#[command(version)]
#[command(about = "Hybrid PASS/FAIL analysis for bottle drop tests", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Training archive (JSON Lines)
    #[arg(long, value_name = "FILE", global = true)]
    archive: Option<PathBuf>,

    /// Persisted parameter snapshot
    #[arg(long, value_name = "FILE", global = true)]
    params: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse measurements and archive the decisions
    Analyze {
        /// JSON file with one measurement or a list of them
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Logistic model artifact to fuse with the rules
        #[arg(short, long, value_name = "FILE")]
        model: Option<PathBuf>,
    },

    /// Record the human-verified verdict for an archived decision
    Confirm {
        /// Decision ID
        id: String,

        /// Verified verdict (PASS or FAIL)
        label: String,

        /// Name of the reviewer
        #[arg(short, long)]
        reviewer: Option<String>,
    },

    /// Re-fit thresholds and calibration curves from confirmed labels
    Adapt,

    /// Train a logistic model on confirmed labels
    TrainModel {
        /// Where to write the model artifact
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Gradient descent epochs
        #[arg(long, default_value = "500")]
        epochs: usize,
    },

    /// Show performance statistics for the archive
    Stats,

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration and parameter snapshot
    Show,

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = if cli.verbose {
        LoggingConfig::verbose()
    } else {
        LoggingConfig::default().with_level(tracing::Level::WARN)
    };
    dt_observability::init_logging_with_config(
        logging.with_json(cli.format == OutputFormat::Json),
    );
    dt_observability::register_metrics();

    if let Commands::Config {
        action: ConfigCommands::Validate,
    } = cli.command
    {
        return cmd_config_validate(cli.config, cli.format);
    }

    let workspace = Workspace::load(cli.config.clone(), cli.archive.clone(), cli.params.clone())?;

    match cli.command {
        Commands::Analyze { input, model } => {
            cmd_analyze(&workspace, input, model, cli.format).await
        }
        Commands::Confirm {
            id,
            label,
            reviewer,
        } => cmd_confirm(&workspace, &id, &label, reviewer, cli.format).await,
        Commands::Adapt => cmd_adapt(&workspace, cli.format).await,
        Commands::TrainModel { output, epochs } => {
            cmd_train_model(&workspace, output, epochs, cli.format).await
        }
        Commands::Stats => cmd_stats(&workspace, cli.format).await,
        Commands::Config { action } => match action {
            ConfigCommands::Show => cmd_config_show(&workspace, cli.format),
            ConfigCommands::Validate => cmd_config_validate(cli.config, cli.format),
        },
    }
}

async fn cmd_analyze(
    workspace: &Workspace,
    input: PathBuf,
    model: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let measurements = read_measurements(&input)?;
    let params = Arc::new(ParameterStore::new(workspace.parameters()?));

    let slot = Arc::new(ModelSlot::empty());
    if let Some(path) = &model {
        let loaded = LogisticModel::load(path)
            .with_context(|| format!("Failed to load model: {}", path.display()))?;
        info!(model = %path.display(), "Loaded model artifact");
        slot.install(Arc::new(loaded));
    }

    let collector = Arc::new(TrainingCollector::new(workspace.archive()));
    let (queue, consumer) =
        spawn_archive_consumer(collector, workspace.config.archive.queue_capacity);
    let engine = AnalysisEngine::new(params).with_model_slot(slot);

    let mut decisions = Vec::new();
    let mut rejected = Vec::new();
    for (index, measurement) in measurements.iter().enumerate() {
        match engine.analyze(measurement) {
            Ok(decision) => {
                // A batch can outrun the queue; wait for room instead of dropping.
                queue.send(decision.clone()).await;
                decisions.push(decision);
            }
            Err(e) => rejected.push((index, e.to_string())),
        }
    }

    // Closing the queue lets the consumer drain and exit.
    drop(queue);
    let archived = consumer.await.context("Archive consumer task failed")?;

    if format == OutputFormat::Json {
        let report = serde_json::json!({
            "decisions": decisions,
            "rejected": rejected
                .iter()
                .map(|(index, error)| serde_json::json!({ "index": index, "error": error }))
                .collect::<Vec<_>>(),
            "archived": archived,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", "Analysis Results".bold());
        println!("────────────────");
        for decision in &decisions {
            print_decision(decision);
        }
        for (index, error) in &rejected {
            println!("  {} #{} rejected: {}", "✗".red(), index, error);
        }
        println!();
        println!(
            "{} analysed, {} rejected, {} archived to {}",
            decisions.len(),
            rejected.len(),
            archived,
            workspace.archive_path.display()
        );
    }

    if decisions.is_empty() && !rejected.is_empty() {
        bail!("No measurement could be analysed");
    }
    Ok(())
}

fn print_decision(decision: &Decision) {
    let verdict = match decision.verdict {
        Verdict::Pass => "PASS".green().bold(),
        Verdict::Fail => "FAIL".red().bold(),
    };
    let review = if decision.uncertain {
        " REVIEW".yellow().bold().to_string()
    } else {
        String::new()
    };
    println!(
        "  {} {} {:.1}% ({}, {}){}",
        decision.id.to_string().cyan(),
        verdict,
        decision.confidence * 100.0,
        decision.confidence_level,
        decision.fusion_path,
        review
    );
    for output in &decision.outputs {
        println!(
            "      {:<5} {} raw {:.3} calibrated {:.3} [{}]",
            output.output.method.as_key(),
            output.output.verdict,
            output.output.raw_confidence,
            output.calibrated_confidence,
            output.output.tags.join(", ")
        );
    }
    for reason in &decision.review_reasons {
        println!("      {} {}", "•".yellow(), reason);
    }
}

async fn cmd_confirm(
    workspace: &Workspace,
    id: &str,
    label: &str,
    reviewer: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let sample_id =
        uuid::Uuid::parse_str(id).with_context(|| format!("Invalid decision ID: {}", id))?;
    let label = Verdict::parse(label)
        .ok_or_else(|| anyhow!("Invalid verdict '{}': expected PASS or FAIL", label))?;

    let collector = TrainingCollector::new(workspace.archive());
    let sample = collector
        .confirm(sample_id, label, reviewer)
        .instrument(decision_span!(sample_id))
        .await
        .with_context(|| format!("Failed to confirm decision {}", sample_id))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&sample)?);
    } else {
        println!(
            "{} {} confirmed as {}",
            "✓".green(),
            sample.id.to_string().cyan(),
            sample.label
        );
        if sample.was_overridden() {
            println!(
                "  Engine said {}, reviewer overrode it",
                sample.decision.verdict
            );
        }
    }
    Ok(())
}

async fn cmd_adapt(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let params = Arc::new(ParameterStore::new(workspace.parameters()?));
    let adapter = ThresholdAdapter::new(workspace.archive(), params.clone(), &workspace.config);

    match adapter.run_now().await {
        Ok(report) => {
            workspace.save_parameters(&params.snapshot())?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_adaptation(&report);
                println!();
                println!(
                    "Parameters v{} saved to {}",
                    report.published_version,
                    workspace.params_path.display()
                );
            }
            Ok(())
        }
        Err(AdaptationError::InsufficientData {
            available,
            required,
        }) => {
            if format == OutputFormat::Json {
                let status = serde_json::json!({
                    "published": false,
                    "strong_samples": available,
                    "required": required,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{}: {} confirmed samples, {} required. Parameters unchanged.",
                    "Not enough data".yellow(),
                    available,
                    required
                );
            }
            Ok(())
        }
        Err(e) => Err(e).context("Adaptation failed"),
    }
}

fn print_adaptation(report: &AdaptationReport) {
    println!("{}", "Adaptation Report".bold());
    println!("─────────────────");
    println!(
        "  Samples: {} ({} confirmed)",
        report.samples_considered, report.strong_samples
    );
    println!(
        "  Deformation limit: {:.4} → {:.4} (cost {:.1} → {:.1})",
        report.global_limit.previous,
        report.global_limit.limit,
        report.global_limit.cost_before,
        report.global_limit.cost_after
    );
    for (material, fit) in &report.category_limits {
        println!(
            "    {}: {:.4} → {:.4} ({} samples)",
            material.cyan(),
            fit.previous,
            fit.limit,
            fit.samples
        );
    }
    if let Some((rule, model)) = report.fusion_weights {
        println!("  Fusion weights: rule {:.2}, model {:.2}", rule, model);
    }
    println!();
    println!("{} ({})", "Calibration Curves".bold(), report.curves.len());
    for curve in &report.curves {
        let quality = curve
            .metrics
            .as_ref()
            .map(|m| m.summary())
            .unwrap_or_else(|| "no metrics".to_string());
        println!(
            "  {} [{}] {} samples: {}",
            curve.key.cyan(),
            curve.calibration_type,
            curve.sample_count,
            quality
        );
    }
}

async fn cmd_train_model(
    workspace: &Workspace,
    output: PathBuf,
    epochs: usize,
    format: OutputFormat,
) -> Result<()> {
    let samples = workspace
        .archive()
        .snapshot(workspace.config.adaptation.window)
        .await
        .context("Failed to read training archive")?;
    let labeled: Vec<_> = samples
        .iter()
        .filter(|s| s.is_strong())
        .map(|s| (s.features.clone(), s.label))
        .collect();

    let options = TrainingOptions {
        epochs,
        version: chrono::Utc::now().format("%Y%m%d%H%M%S").to_string(),
        ..TrainingOptions::default()
    };
    let (model, summary) =
        LogisticModel::fit(&labeled, &options).context("Model training failed")?;

    let artifact = serde_json::to_string_pretty(model.artifact())?;
    std::fs::write(&output, artifact)
        .with_context(|| format!("Failed to write model artifact: {}", output.display()))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", "Model Trained".bold());
        println!("─────────────");
        println!("  Version: {}", options.version);
        println!(
            "  Samples: {} training, {} validation",
            summary.training_samples, summary.validation_samples
        );
        println!(
            "  Accuracy: {:.1}% training, {:.1}% validation",
            summary.training_accuracy * 100.0,
            summary.validation_accuracy * 100.0
        );
        println!("  Written to {}", output.display());
    }
    Ok(())
}

async fn cmd_stats(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let samples = workspace
        .archive()
        .snapshot(None)
        .await
        .context("Failed to read training archive")?;
    let stats = PerformanceStats::from_samples(&samples);

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let percent = |v: Option<f64>| {
        v.map(|a| format!("{:.1}%", a * 100.0))
            .unwrap_or_else(|| "n/a".to_string())
    };

    println!("{}", "Archive Statistics".bold());
    println!("──────────────────");
    println!("  Decisions: {}", stats.total);
    println!("  Confirmed: {}", stats.strong_labeled);
    println!("  Flagged for review: {}", stats.uncertain);
    println!("  Hybrid rate: {:.1}%", stats.hybrid_rate * 100.0);
    println!("  Override rate: {:.1}%", stats.override_rate * 100.0);
    println!();
    println!("{}", "Fusion Paths".bold());
    for (path, count) in &stats.fusion_paths {
        let confidence = stats.average_confidence.get(path).copied().unwrap_or(0.0);
        println!(
            "  {}: {} (avg confidence {:.1}%)",
            path,
            count,
            confidence * 100.0
        );
    }
    println!();
    println!("{}", "Accuracy on confirmed labels".bold());
    println!("  Rule:  {}", percent(stats.rule_accuracy.accuracy()));
    println!("  Model: {}", percent(stats.model_accuracy.accuracy()));
    println!("  Fused: {}", percent(stats.fused_accuracy.accuracy()));
    println!();
    println!("{}", "Materials".bold());
    for (material, counts) in &stats.materials {
        println!(
            "  {}: {} pass, {} fail",
            material.cyan(),
            counts.pass,
            counts.fail
        );
    }
    Ok(())
}

fn cmd_config_show(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let params = workspace.parameters()?;

    if format == OutputFormat::Json {
        let shown = serde_json::json!({
            "config": workspace.config,
            "parameters": params,
        });
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    println!("{}", "Effective Configuration".bold());
    println!("───────────────────────");
    match &workspace.config_path {
        Some(path) => println!("  Source: {}", path.display()),
        None => println!("  Source: built-in defaults"),
    }
    println!("  Archive: {}", workspace.archive_path.display());
    println!("  Parameters: {}", workspace.params_path.display());
    println!();
    print!("{}", workspace.config.to_yaml()?);
    println!();
    println!("{} v{}", "Parameter Snapshot".bold(), params.version);
    println!(
        "  Deformation limit: {:.4}",
        params.thresholds.deformation_limit
    );
    for (material, limit) in &params.thresholds.category_limits {
        println!("    {}: {:.4}", material.cyan(), limit);
    }
    println!(
        "  Fusion weights: rule {:.2}, model {:.2}",
        params.fusion.rule_weight, params.fusion.model_weight
    );
    println!("  Calibration curves: {}", params.calibration.len());
    for curve in params.calibration.iter() {
        println!(
            "    {} [{}] {} samples",
            curve.key().to_storage_key().cyan(),
            curve.calibration_type(),
            curve.sample_count()
        );
    }
    Ok(())
}

fn cmd_config_validate(config_path: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let result = match &config_path {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => ConfigValidator::validate(&config),
            Err(e) => {
                let mut result = ValidationResult::new();
                result.add_error(e.to_string());
                result
            }
        },
        None => ConfigValidator::validate(&EngineConfig::default()),
    };

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        match &config_path {
            Some(path) => println!(
                "Validating configuration: {}",
                path.display().to_string().cyan()
            ),
            None => println!("Validating built-in defaults"),
        }
        result.print();
        println!();
        if result.has_errors() {
            println!(
                "{}",
                "Configuration validation failed. Fix the errors above."
                    .red()
                    .bold()
            );
        } else if result.has_warnings() {
            println!(
                "{}",
                "Configuration is valid with warnings. Review the warnings above."
                    .yellow()
                    .bold()
            );
        } else {
            println!("{}", "Configuration is valid.".green().bold());
        }
    }

    if result.has_errors() {
        bail!("Configuration is invalid");
    }
    Ok(())
}
