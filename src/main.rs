//! runwright: run declarative pipelines of external tasks and model queries
//! against a target, keeping every stage's output in a per-run directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use runwright_lib::config::{self, EnvConfig};
use runwright_lib::context::RunContext;
use runwright_lib::pipeline::artifact::Run;
use runwright_lib::pipeline::cache::{cache_key, JsonFileCache};
use runwright_lib::pipeline::definition::PipelineDefinition;
use runwright_lib::pipeline::invoker::ProcessInvoker;
use runwright_lib::pipeline::llm::{LlmClient, ModelRouter, OllamaClient};
use runwright_lib::pipeline::stage::{RunReport, StageEvent, StageState};
use runwright_lib::serve::spawn_static_server;

#[derive(Parser)]
#[command(name = "runwright")]
#[command(version)]
#[command(about = "Resilient external-task pipelines with fallback-aware caching")]
#[command(long_about = None)]
struct Cli {
    /// Debug-level logging (overridden by RUNWRIGHT_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of a pipeline against a target
    Run {
        /// Pipeline definition (JSON)
        #[arg(short, long, value_name = "FILE")]
        pipeline: PathBuf,

        /// Target identifier handed to every stage
        #[arg(short, long, env = config::ENV_TARGET)]
        target: Option<String>,

        /// Reuse an existing run directory instead of creating one
        #[arg(long, value_name = "DIR")]
        run_dir: Option<PathBuf>,

        /// Root under which new run directories are created
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Serve the run directory at this address while the pipeline runs
        #[arg(long, value_name = "ADDR")]
        serve: Option<String>,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Run one stage against an existing run (RUNWRIGHT_TARGET, RUNWRIGHT_RUN_DIR)
    Stage {
        /// Pipeline definition (JSON)
        #[arg(short, long, value_name = "FILE")]
        pipeline: PathBuf,

        /// Stage to run
        #[arg(short, long)]
        name: String,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Serve a run directory over HTTP in the foreground
    Serve {
        #[arg(short, long, value_name = "DIR")]
        dir: PathBuf,

        #[arg(short, long, default_value = config::DEFAULT_SERVE_ADDR)]
        addr: String,
    },

    /// Print the cache key for a query text
    CacheKey {
        #[arg(value_name = "TEXT")]
        text: String,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Ollama base URL
    #[arg(long, env = config::ENV_OLLAMA_URL, default_value = config::DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Model used for queries
    #[arg(long, env = config::ENV_MODEL, default_value = config::DEFAULT_MODEL)]
    model: String,

    /// Ask the model server which installed model suits the pipeline
    #[arg(long)]
    auto_model: bool,

    /// Result cache file (shared across runs)
    #[arg(long, env = config::ENV_CACHE, value_name = "FILE")]
    cache: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    runwright_lib::init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            pipeline,
            target,
            run_dir,
            root,
            serve,
            model,
        } => {
            let target = target.with_context(|| {
                format!("a target is required (--target or {})", config::ENV_TARGET)
            })?;
            let definition = load_definition(&pipeline)?;

            let run = match run_dir {
                Some(dir) => Run::open(dir, &target)?,
                None => {
                    let root = root.unwrap_or_else(config::default_runs_root);
                    Run::create(&root, &target, chrono::Utc::now())?
                }
            };
            println!("Run {} → {}", run.id, run.dir.display());

            let server = match serve {
                Some(addr) => {
                    let server = spawn_static_server(&run.dir, &addr)?;
                    println!("Serving {} at {}", run.dir.display(), server.url());
                    Some(server)
                }
                None => None,
            };

            let mut ctx = build_context(run, &model, &definition.name)?;
            let runner = definition.runner();
            let total = runner.stage_names().len();
            let progress = move |event: StageEvent| {
                if let StageEvent::StageStarted { index, name } = event {
                    eprintln!("[{}/{}] {name}", index + 1, total);
                }
            };

            let report = runner.run(&mut ctx, Some(&progress));
            print_summary(&report);

            if let Some(server) = server {
                println!("Still serving at {} (Ctrl-C to stop)", server.url());
                server.wait();
            }
        }

        Commands::Stage {
            pipeline,
            name,
            model,
        } => {
            let env = EnvConfig::from_env()?;
            let definition = load_definition(&pipeline)?;
            let run = Run::open(&env.run_dir, &env.target)?;
            let mut ctx = build_context(run, &model, &definition.name)?;

            let record = definition
                .runner()
                .run_stage(&mut ctx, &name)
                .with_context(|| format!("no stage named '{name}' in {}", pipeline.display()))?;

            println!("{} {}", record.name, record.state);
            if record.state == StageState::Failed {
                bail!(
                    "stage '{}' failed: {}",
                    record.name,
                    record.error.unwrap_or_default()
                );
            }
        }

        Commands::Serve { dir, addr } => {
            let server = spawn_static_server(&dir, &addr)?;
            println!("Serving {} at {} (Ctrl-C to stop)", dir.display(), server.url());
            server.wait();
        }

        Commands::CacheKey { text } => {
            println!("{}", cache_key(&text));
        }
    }

    Ok(())
}

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    PipelineDefinition::load(path)
        .with_context(|| format!("cannot use pipeline definition {}", path.display()))
}

fn build_context(run: Run, args: &ModelArgs, task: &str) -> Result<RunContext> {
    let client = OllamaClient::new(&args.ollama_url, config::DEFAULT_LLM_TIMEOUT_SECS)?;

    let model = if args.auto_model {
        let choice = ModelRouter::new(&args.model)
            .with_choices_log(run.dir.join(config::MODEL_CHOICES_FILE))
            .choose(&client as &dyn LlmClient, task, None);
        println!("Model: {} ({})", choice.model, choice.reason);
        choice.model
    } else {
        args.model.clone()
    };

    let cache_path = args.cache.clone().unwrap_or_else(config::default_cache_path);
    let cache = JsonFileCache::open(cache_path);

    Ok(RunContext::new(
        run,
        Box::new(client),
        Box::new(ProcessInvoker),
        Box::new(cache),
    )
    .with_model(model))
}

fn print_summary(report: &RunReport) {
    println!();
    for record in &report.records {
        let detail = record
            .error
            .as_deref()
            .or(record.skip_reason.as_deref())
            .unwrap_or("");
        println!(
            "  {:<24} {:<8} {:>7}ms  {}",
            record.name, record.state, record.duration_ms, detail
        );
    }
    if let Some(reason) = &report.short_circuit {
        println!("  short-circuited: {reason}");
    }
    println!(
        "\n{} done, {} failed, {} skipped in {}ms",
        report.count(StageState::Done),
        report.count(StageState::Failed),
        report.count(StageState::Skipped),
        report.duration_ms
    );
}
