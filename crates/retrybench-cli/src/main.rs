use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use retrybench_core::{
    builtin_exercise_sets, load_all_exercise_sets, select_exercises, BenchError,
    BenchmarkSession, Difficulty, ExerciseSet, RetryBenchConfig, Termination,
};
use retrybench_engine::{
    load_report, JsonReportWriter, ModelClient, ModelInfo, OllamaClient, ReportWriter,
    SessionEvent, SessionRunner,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "retrybench")]
#[command(about = "Retrybench - how well do models fix their own code?", long_about = None)]
struct Cli {
    /// Ollama host URL
    #[arg(long, global = true, env = "OLLAMA_HOST")]
    ollama_host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available models
    Models,

    /// Run the benchmark against one model
    Run(RunArgs),

    /// List the exercise catalog
    List {
        /// Load exercise sets from this directory instead of the built-in ones
        #[arg(long)]
        exercises: Option<PathBuf>,

        /// Only show these difficulties (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        difficulty: Vec<Difficulty>,
    },

    /// Print the summary of a saved report
    Show {
        /// Path to a benchmark_results_*.json file
        report: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Model ID to benchmark
    model: String,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Difficulties to run (basic, intermediate, advanced, super_hard)
    #[arg(short, long, value_delimiter = ',')]
    difficulty: Vec<Difficulty>,

    /// Attempts per exercise
    #[arg(short = 'n', long)]
    max_attempts: Option<u32>,

    /// Time limit for loading the code and for each test case
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Exercises evaluated at the same time
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Temperature for generation
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Load exercise sets from this directory instead of the built-in ones
    #[arg(long)]
    exercises: Option<PathBuf>,

    /// Directory for the JSON report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Do not write a report
    #[arg(long)]
    no_save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Models => cmd_models(&get_ollama_host(cli.ollama_host)).await?,
        Commands::Run(args) => cmd_run(args, cli.ollama_host).await?,
        Commands::List {
            exercises,
            difficulty,
        } => cmd_list(exercises.as_deref(), &difficulty)?,
        Commands::Show { report } => cmd_show(&report)?,
    }

    Ok(())
}

fn get_ollama_host(flag: Option<String>) -> String {
    flag.unwrap_or_else(|| RetryBenchConfig::default().ollama.host)
}

/// Ollama lists untagged models with an explicit `:latest`.
fn model_listed(models: &[ModelInfo], model: &str) -> bool {
    models
        .iter()
        .any(|m| m.name == model || m.name.strip_suffix(":latest") == Some(model))
}

fn load_sets(dir: Option<&Path>) -> Result<Vec<ExerciseSet>> {
    let sets = match dir {
        Some(dir) => load_all_exercise_sets(dir)
            .with_context(|| format!("loading exercises from {}", dir.display()))?,
        None => builtin_exercise_sets()?,
    };
    Ok(sets)
}

async fn cmd_models(host: &str) -> Result<()> {
    let client = OllamaClient::new(host);
    let models = client.list_models().await?;

    println!();
    println!("Available Models:");
    println!("{:-<75}", "");
    println!("  {:<4} {:<40} {:<10} {}", "#", "ID", "Params", "Quantization");
    println!("{:-<75}", "");
    for (i, m) in models.iter().enumerate() {
        let params = m.parameter_size.as_deref().unwrap_or("-");
        let quant = m.quantization.as_deref().unwrap_or("-");
        println!("  {:<4} {:<40} {:<10} {}", i + 1, m.name, params, quant);
    }
    println!();
    println!("  Use: retrybench run <ID> (e.g., `retrybench run qwen2.5-coder:7b`)");
    println!();

    Ok(())
}

fn cmd_list(dir: Option<&Path>, difficulty: &[Difficulty]) -> Result<()> {
    let sets = load_sets(dir)?;
    let filter = match difficulty.is_empty() {
        true => Difficulty::all(),
        false => difficulty,
    };

    println!();
    for set in &sets {
        let shown: Vec<_> = set
            .exercises
            .iter()
            .filter(|e| filter.contains(&e.difficulty))
            .collect();
        if shown.is_empty() {
            continue;
        }
        println!("{} ({} exercises)", set.name, shown.len());
        println!("{:-<65}", "");
        for ex in shown {
            println!(
                "  {:<32} {:<14} {:>3} cases  {}",
                ex.name,
                ex.difficulty.label(),
                ex.test_cases.len(),
                ex.function_name
            );
        }
        println!();
    }
    println!(
        "  {} exercises selected",
        select_exercises(&sets, filter).len()
    );
    println!();

    Ok(())
}

async fn cmd_run(args: RunArgs, ollama_host: Option<String>) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RetryBenchConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RetryBenchConfig::default(),
    };
    if let Some(host) = ollama_host {
        config.ollama.host = host;
    }
    if !args.difficulty.is_empty() {
        config.session.difficulties = args.difficulty;
    }
    if let Some(n) = args.max_attempts {
        config.session.max_attempts = n;
    }
    if let Some(ms) = args.timeout_ms {
        config.session.timeout_ms = ms;
    }
    if let Some(c) = args.concurrency {
        config.session.concurrency = c;
    }
    if let Some(t) = args.temperature {
        config.session.temperature = t;
    }
    if let Some(dir) = args.output {
        config.output.dir = dir;
    }
    if args.no_save {
        config.output.save = false;
    }
    config.session.validate()?;

    let sets = load_sets(args.exercises.as_deref())?;
    let exercises = select_exercises(&sets, &config.session.difficulties);

    let client: Arc<dyn ModelClient> = Arc::new(OllamaClient::from_config(&config.ollama)?);
    match client.list_models().await {
        Ok(models) if !model_listed(&models, &args.model) => {
            warn!("Model {} is not among the models Ollama reports", args.model)
        }
        Ok(_) => {}
        Err(e) => warn!("Ollama at {} is not responding: {}", config.ollama.host, e),
    }

    println!();
    println!("Running benchmark...");
    println!("  Model: {}", args.model);
    println!("  Exercises: {}", exercises.len());
    println!("  Max attempts: {}", config.session.max_attempts);
    println!("  Timeout: {} ms", config.session.timeout_ms);
    println!("  Concurrency: {}", config.session.concurrency);
    println!();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight requests");
            interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let runner = SessionRunner::new(client).with_events(tx);
    let outcome = runner
        .run(&args.model, &config.session, &exercises, cancel)
        .await;
    drop(runner);
    let _ = printer.await;

    let session = match outcome {
        Ok(session) => session,
        Err(BenchError::SessionAborted { reason, partial }) => {
            print_summary(&partial);
            save(&config, &partial)?;
            anyhow::bail!("session aborted: {reason}");
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(&session);
    save(&config, &session)?;
    Ok(())
}

fn save(config: &RetryBenchConfig, session: &BenchmarkSession) -> Result<()> {
    if !config.output.save {
        return Ok(());
    }
    let path = JsonReportWriter::new(&config.output.dir).write(session)?;
    println!("Results saved to {}", path.display());
    Ok(())
}

fn cmd_show(path: &Path) -> Result<()> {
    let session =
        load_report(path).with_context(|| format!("reading report {}", path.display()))?;
    print_summary(&session);
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ExerciseStarted {
            current,
            total,
            name,
            difficulty,
        } => println!("[{}/{}] {} ({})", current, total, name, difficulty.label()),
        SessionEvent::AttemptFinished {
            exercise,
            attempt,
            classification,
            error,
            passed_cases,
            total_cases,
            duration_ms,
        } => {
            let detail = error.as_deref().unwrap_or("");
            println!(
                "    {} attempt {}: {} {}/{} cases in {:.0} ms {}",
                exercise, attempt, classification, passed_cases, total_cases, duration_ms, detail
            );
        }
        SessionEvent::ExerciseFinished {
            name,
            status,
            attempts,
        } => println!("  => {}: {} after {} attempt(s)", name, status, attempts),
        SessionEvent::Aborted { reason } => println!("Session aborted: {}", reason),
        SessionEvent::Cancelled => println!("Session cancelled"),
        SessionEvent::SessionStarted { .. }
        | SessionEvent::AttemptStarted { .. }
        | SessionEvent::Done { .. } => {}
    }
}

fn print_summary(session: &BenchmarkSession) {
    let stats = &session.stats;

    println!();
    println!("Results for {}:", session.model);
    println!("{:-<50}", "");
    println!(
        "  Passed:        {}/{} ({:.1}%)",
        stats.passed,
        stats.total,
        stats.success_rate * 100.0
    );
    println!("  Failed:        {}", stats.failed);
    println!("  Errors:        {}", stats.errors);
    println!(
        "  Attempts:      {} total, {:.2} per exercise",
        stats.total_attempts, stats.average_attempts
    );
    if let Some(mean) = stats.mean_attempts_to_pass {
        println!("  To pass:       {:.2} attempts on average", mean);
    }
    println!("  Total time:    {:.1} s", stats.total_time_ms / 1000.0);

    if !stats.per_difficulty.is_empty() {
        println!();
        println!("  By difficulty:");
        for (difficulty, d) in &stats.per_difficulty {
            println!(
                "    {:<14} {}/{} ({:.1}%)",
                difficulty.label(),
                d.passed,
                d.total,
                d.success_rate * 100.0
            );
        }
    }
    if !stats.attempts_to_pass.is_empty() {
        println!();
        println!("  Passed on attempt:");
        for (attempt, count) in &stats.attempts_to_pass {
            println!("    #{:<3} {}", attempt, count);
        }
    }

    match &session.termination {
        Termination::Completed => {}
        Termination::Cancelled => println!(
            "\n  Cancelled; {} exercise(s) not run",
            session.incomplete.len()
        ),
        Termination::Aborted { reason } => println!(
            "\n  Aborted ({}); {} exercise(s) not run",
            reason,
            session.incomplete.len()
        ),
    }
    println!();
}
