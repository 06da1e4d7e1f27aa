//! Edison - iterative prompt refinement workbench
//!
//! CLI entry point: run experiments, validate experiment files, print
//! reports.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use edison::cli::{Cli, Command, ExperimentFile, LoadedExperiment};
use edison::config::EdisonConfig;
use edison::domain::{FinalReport, Review, ReviewDecision};
use edison::events::{EdisonEvent, EventBus, create_event_bus, spawn_event_logger};
use edison::orchestrator::{
    ExperimentLockManager, ExperimentManager, ManagerParams, ReviewHandle, build_final_report, recover,
};
use edison::safety::SafetyScanner;
use edison::state::StateManager;

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edison")
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = data_dir().join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Level precedence: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(log_dir.join("edison.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = EdisonConfig::load_log_level(cli.config.as_deref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = EdisonConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Validate { experiment_file } => cmd_validate(&experiment_file),
        Command::Run {
            experiment_file,
            auto_approve,
        } => cmd_run(&config, &experiment_file, auto_approve).await,
        Command::Report { experiment_id } => cmd_report(&config, &experiment_id).await,
        Command::Generate {
            experiment_file,
            count,
        } => cmd_generate(&config, &experiment_file, count).await,
    }
}

fn cmd_validate(experiment_file: &Path) -> Result<()> {
    let loaded = ExperimentFile::load(experiment_file).and_then(ExperimentFile::into_domain);
    match loaded {
        Ok(loaded) => {
            println!("{} {}", "ok".green().bold(), experiment_file.display());
            println!("  objective: {}", loaded.experiment.objective);
            let weight_sum: f64 = loaded.experiment.rubric.criteria.iter().map(|c| c.weight).sum();
            println!(
                "  rubric: {} criteria (weight sum {:.3})",
                loaded.experiment.rubric.criteria.len(),
                weight_sum
            );
            for criterion in &loaded.experiment.rubric.criteria {
                println!(
                    "    - {} w={:.2} scale=[{}, {}]",
                    criterion.name, criterion.weight, criterion.scale.min, criterion.scale.max
                );
            }
            println!(
                "  models: {}, judges: {}, cases: {}",
                loaded.model_configs.len(),
                loaded.judge_configs.len(),
                loaded.dataset.cases.len()
            );
            if let Some(budget) = loaded.experiment.stop_rules.max_budget_usd {
                println!(
                    "  budget: {:.2} USD (alert at {:.0}%)",
                    budget,
                    loaded.experiment.stop_rules.alert_threshold * 100.0
                );
            }
            Ok(())
        }
        Err(error) => {
            println!("{} {}", "invalid".red().bold(), experiment_file.display());
            println!("  {error}");
            std::process::exit(1);
        }
    }
}

async fn cmd_run(config: &EdisonConfig, experiment_file: &Path, auto_approve: bool) -> Result<()> {
    let state = StateManager::open(config.resolved_store_path())?;
    let registry = Arc::new(config.build_registry());
    let bus = create_event_bus();
    let _event_logger = spawn_event_logger(&bus, data_dir().join("events"));

    // Repair anything a previous process left behind
    let locks = ExperimentLockManager::new(state.clone(), config.lock.clone());
    let recovered = recover(&state, &locks).await?;
    if !recovered.is_empty() {
        info!(actions = recovered.len(), "recovery applied");
    }

    let LoadedExperiment {
        experiment,
        seed_prompt,
        model_configs,
        judge_configs,
        dataset,
    } = ExperimentFile::load(experiment_file)?.into_domain()?;

    state.create_experiment(&experiment).await?;
    state.create_dataset(&dataset).await?;
    state.create_prompt_version(&seed_prompt).await?;
    for model_config in &model_configs {
        state.create_model_config(model_config).await?;
    }
    for judge_config in &judge_configs {
        state.create_judge_config(judge_config).await?;
    }

    println!(
        "{} experiment {} ({} models x {} cases)",
        "running".cyan().bold(),
        experiment.id,
        model_configs.len(),
        dataset.cases.len()
    );

    let mut manager = ExperimentManager::new(ManagerParams {
        state: state.clone(),
        registry,
        bus: bus.clone(),
        scheduler: config.scheduler.clone(),
        refiner: config.refiner.clone(),
        scanner: Arc::new(SafetyScanner::new(&config.safety_patterns)),
        lock_config: config.lock.clone(),
        deadline: config
            .iteration_deadline_secs
            .map(std::time::Duration::from_secs),
    });

    let reviewer = spawn_reviewer(bus.clone(), manager.review_handle(), state.clone(), auto_approve);
    let report = manager.run_experiment(&experiment.id, &dataset.id).await?;
    reviewer.abort();

    print_report(&report);
    Ok(())
}

async fn cmd_report(config: &EdisonConfig, experiment_id: &str) -> Result<()> {
    let state = StateManager::open(config.resolved_store_path())?;
    let experiment = state.get_experiment_required(experiment_id).await?;

    let history = state.iteration_history(experiment_id).await?;
    let stop_reason = history
        .iter()
        .rev()
        .find_map(|iteration| iteration.stop_reason.clone())
        .unwrap_or_else(|| "in_progress".to_string());

    let report = build_final_report(&state, &experiment, &stop_reason).await?;
    print_report(&report);
    Ok(())
}

async fn cmd_generate(config: &EdisonConfig, experiment_file: &Path, count: usize) -> Result<()> {
    let loaded = ExperimentFile::load(experiment_file)?.into_domain()?;
    let model = loaded
        .model_configs
        .first()
        .ok_or_else(|| eyre::eyre!("experiment file defines no models"))?;

    let registry = config.build_registry();
    let adapter = registry.adapter(&model.provider, &model.model)?;
    let variables = loaded.seed_prompt.template_variables();

    let cases = edison::evaluator::generate_cases(
        &adapter,
        &loaded.experiment.objective,
        &loaded.seed_prompt.body,
        &variables,
        count,
    )
    .await?;

    println!("{} {} synthetic cases", "generated".green().bold(), cases.len());
    for case in &cases {
        println!("- input:");
        for (name, value) in &case.input {
            println!("    {name}: {value}");
        }
        if let Some(expected) = &case.expected {
            println!("  expected: {expected}");
        }
        if !case.tags.is_empty() {
            println!("  tags: [{}]", case.tags.join(", "));
        }
        println!("  difficulty: {}", case.difficulty);
    }
    Ok(())
}

/// Handle refine:completed events: auto-approve or prompt on stdin
fn spawn_reviewer(
    bus: Arc<EventBus>,
    reviews: ReviewHandle,
    state: StateManager,
    auto_approve: bool,
) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            let EdisonEvent::RefineCompleted { suggestion_id, .. } = event else {
                continue;
            };

            let decision = if auto_approve {
                ReviewDecision::Approve
            } else {
                match prompt_for_decision(&state, &suggestion_id).await {
                    Some(decision) => decision,
                    None => ReviewDecision::Reject,
                }
            };

            let review = Review::new(&suggestion_id, "cli", decision);
            if let Err(e) = reviews.submit(review) {
                warn!(error = %e, "could not submit review");
                return;
            }
            debug!(%suggestion_id, ?decision, "review submitted");
        }
    })
}

async fn prompt_for_decision(state: &StateManager, suggestion_id: &str) -> Option<ReviewDecision> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    if let Ok(suggestion) = state.get_suggestion_required(suggestion_id).await {
        println!("\n{}", "refinement proposed".yellow().bold());
        println!("{}", suggestion.note.trim());
        println!("{}", suggestion.diff.trim().dimmed());
    }
    print!("{} ", "apply this refinement? [y/N]".bold());
    use std::io::Write;
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    reader.read_line(&mut line).await.ok()?;
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(ReviewDecision::Approve),
        _ => Some(ReviewDecision::Reject),
    }
}

fn print_report(report: &FinalReport) {
    println!("\n{}", "final report".green().bold());
    println!("  stop reason:    {}", report.stop_reason);
    println!("  iterations run: {}", report.iterations_run);
    println!("  composite:      {:.2}", report.composite_score);
    println!("  best prompt:    {}", report.best_prompt_version_id);
    println!(
        "  spend:          {:.4} USD over {} tokens",
        report.total_cost_usd, report.total_tokens
    );
    if !report.per_model_ranking.is_empty() {
        println!("  ranking:");
        for (index, entry) in report.per_model_ranking.iter().enumerate() {
            println!(
                "    {}. {}/{} composite {:.2} (CI {:.2}..{:.2}) cost {:.4} USD",
                index + 1,
                entry.provider,
                entry.model,
                entry.mean_composite,
                entry.ci_lower,
                entry.ci_upper,
                entry.cost_usd
            );
        }
    }
    for recommendation in &report.recommendations {
        println!("  {} {}", "->".cyan(), recommendation);
    }
}
