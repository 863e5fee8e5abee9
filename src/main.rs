//! vvrun CLI - HPC test orchestrator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vvrun::adapter::{
    BatchSystemAdapter, local::LocalAdapter, shell::ShellAdapter, slurm::SlurmAdapter,
};
use vvrun::batch::{BatchJobMonitor, MonitorSettings};
use vvrun::config::{self, AdapterConfig, Config};
use vvrun::manifest::load_manifest;
use vvrun::orchestrator::{
    BatchOrchestrator, DirectOrchestrator, DirectScheduler, MachinePool, RunResult,
    load_job_tests, start_results_log,
};
use vvrun::report::{ConsoleReporter, MultiReporter, print_summary};
use vvrun::resultlog::{
    LogAttrs, ResultLogReader, current_rundate, latest_results_file, results_file_path,
};
use vvrun::timeout::{TimeHandler, parse_seconds};

#[derive(Parser)]
#[command(name = "vvrun")]
#[command(about = "Dependency-aware HPC test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vvrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Submit tests to the batch queue instead of running them here
        #[arg(long)]
        batch: bool,

        /// Run the test list of one batch job (used inside job scripts)
        #[arg(long, value_name = "N")]
        job_id: Option<usize>,

        /// Timeout for every test, e.g. 600, 10m, 1:30:00
        #[arg(short = 'T', long, value_parser = parse_seconds)]
        timeout: Option<u64>,

        /// Processors available to a direct run
        #[arg(short = 'n', long = "num-procs")]
        num_procs: Option<usize>,

        /// Distinct processor ids, if larger than the number available
        #[arg(long)]
        max_procs: Option<usize>,

        /// Devices available to a direct run
        #[arg(long)]
        devices: Option<usize>,

        /// Maximum batch jobs in the queue at once
        #[arg(long)]
        qsub_limit: Option<usize>,

        /// Target sum of test timeouts per batch job
        #[arg(long, value_parser = parse_seconds)]
        batch_length: Option<u64>,
    },

    /// Summarize the most recent results
    Status,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

/// Command line overrides for `run`.
struct RunOptions {
    batch: bool,
    job_id: Option<usize>,
    timeout: Option<u64>,
    num_procs: Option<usize>,
    max_procs: Option<usize>,
    devices: Option<usize>,
    qsub_limit: Option<usize>,
    batch_length: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            batch,
            job_id,
            timeout,
            num_procs,
            max_procs,
            devices,
            qsub_limit,
            batch_length,
        } => {
            let opts = RunOptions {
                batch,
                job_id,
                timeout,
                num_procs,
                max_procs,
                devices,
                qsub_limit,
                batch_length,
            };
            let result = run_tests(&cli.config, opts, cli.verbose).await?;
            std::process::exit(result.exit_code());
        }
        Commands::Status => show_status(&cli.config),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Loads the config and anchors its paths at the config file's directory.
fn load_run_config(config_path: &Path) -> Result<(Config, PathBuf)> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let abs = std::path::absolute(config_path)
        .with_context(|| format!("Failed to resolve {}", config_path.display()))?;
    let base = abs
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_paths(&base);
    config.batch.apply_env_overrides();
    Ok((config, abs))
}

async fn run_tests(config_path: &Path, opts: RunOptions, verbose: bool) -> Result<RunResult> {
    let (mut config, abs_config) = load_run_config(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    if let Some(n) = opts.num_procs {
        config.vvrun.num_procs = Some(n);
    }
    if let Some(n) = opts.max_procs {
        config.vvrun.max_procs = Some(n);
    }
    if let Some(n) = opts.devices {
        config.vvrun.num_devices = n;
    }
    if let Some(n) = opts.qsub_limit {
        config.batch.max_jobs = n;
    }
    if let Some(n) = opts.batch_length {
        config.batch.batch_length = n;
    }
    if opts.timeout.is_some() {
        config.vvrun.timeouts.timeout = opts.timeout;
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            token.cancel();
        }
    });

    if let Some(batch_id) = opts.job_id {
        return run_job(&config, batch_id, opts.timeout, cancel, verbose).await;
    }

    let results_dir = config.vvrun.results_dir.clone();
    std::fs::create_dir_all(&results_dir)
        .with_context(|| format!("Failed to create {}", results_dir.display()))?;

    let mut tests = load_manifest(&config.vvrun.manifest)?;
    let previous = latest_results_file(&results_dir)
        .and_then(|path| ResultLogReader::read_lenient(&path));
    let timer = TimeHandler::from_config(&config.vvrun.timeouts);
    if let Some(prev) = &previous {
        timer.load_prior_runtimes(&mut tests, prev);
    }
    timer.set_timeouts(&mut tests, previous.as_ref());

    let rundate = current_rundate();
    let mut attrs = LogAttrs::new();
    let mode = if opts.batch || config.batch.enabled { "batch" } else { "direct" };
    attrs.insert("mode".into(), mode.into());
    let log = start_results_log(
        &results_file_path(&results_dir.join("testlist"), &rundate),
        &rundate,
        attrs,
    )?;
    info!("Writing results to {}", log.path().display());

    let sched = DirectScheduler::new(tests, true)?.with_log(log.clone());
    let reporter = create_reporter(&config, verbose);

    if mode == "batch" {
        let exe = std::env::current_exe().context("Failed to locate the vvrun executable")?;
        let job_command = vec![
            exe.display().to_string(),
            "--config".to_string(),
            abs_config.display().to_string(),
        ];
        let settings = MonitorSettings::from_config(&config, job_command);

        match &config.batch.adapter {
            AdapterConfig::Slurm(cfg) => {
                let adapter = SlurmAdapter::new(cfg.clone());
                run_batch(&config, adapter, settings, sched, log, &rundate, reporter, cancel).await
            }
            AdapterConfig::Local(cfg) => {
                let adapter = LocalAdapter::new(cfg.clone());
                run_batch(&config, adapter, settings, sched, log, &rundate, reporter, cancel).await
            }
            AdapterConfig::Shell(cfg) => {
                let adapter = ShellAdapter::new(cfg.clone())?;
                run_batch(&config, adapter, settings, sched, log, &rundate, reporter, cancel).await
            }
        }
    } else {
        let np = config.vvrun.num_procs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let nd = config.vvrun.num_devices;
        let pool = MachinePool::new(
            np,
            config.vvrun.max_procs.unwrap_or(np),
            nd,
            config.vvrun.max_devices.unwrap_or(nd),
        );
        DirectOrchestrator::new(pool, &results_dir, reporter)
            .configured(&config)
            .with_cancel_token(cancel)
            .run(sched)
            .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_batch<A: BatchSystemAdapter>(
    config: &Config,
    adapter: A,
    settings: MonitorSettings,
    sched: DirectScheduler,
    log: vvrun::resultlog::ResultLogWriter,
    rundate: &str,
    reporter: MultiReporter,
    cancel: CancellationToken,
) -> Result<RunResult> {
    info!("Using batch adapter: {}", adapter.name());
    let monitor = BatchJobMonitor::new(adapter, settings, &config.vvrun.results_dir, rundate)
        .with_parent_log(log);
    BatchOrchestrator::new(monitor, reporter)
        .with_sleep(Duration::from_secs(config.batch.sleep_secs))
        .with_total_timeout(
            config
                .vvrun
                .timeouts
                .total_timeout
                .filter(|t| *t > 0)
                .map(Duration::from_secs),
        )
        .with_cancel_token(cancel)
        .run(sched)
        .await
}

/// Runs the test list of one batch job on the node the job landed on.
async fn run_job(
    config: &Config,
    batch_id: usize,
    timeout: Option<u64>,
    cancel: CancellationToken,
    verbose: bool,
) -> Result<RunResult> {
    let mut job = load_job_tests(&config.vvrun.results_dir, batch_id)?;
    if let Some(t) = timeout {
        for tc in job.tests.iter_mut() {
            tc.status.timeout = Some(t);
        }
    }
    info!(
        "Batch {}: running {} tests, writing {}",
        batch_id,
        job.tests.len(),
        job.results_file.display()
    );

    let mut attrs = LogAttrs::new();
    attrs.insert("batch_id".into(), batch_id.into());
    let log = start_results_log(&job.results_file, &job.rundate, attrs)?;
    let sched = DirectScheduler::new(job.tests, false)?.with_log(log);

    let reporter = ConsoleReporter::new(verbose).with_progress(false);
    DirectOrchestrator::new(
        MachinePool::sized_for(job.max_size),
        &config.vvrun.results_dir,
        reporter,
    )
    .configured(config)
    .with_cancel_token(cancel)
    .run(sched)
    .await
}

fn show_status(config_path: &Path) -> Result<()> {
    let (config, _) = load_run_config(config_path)?;
    let results_dir = &config.vvrun.results_dir;
    let Some(path) = latest_results_file(results_dir) else {
        bail!("No results found in {}", results_dir.display());
    };

    let log = ResultLogReader::read(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    println!("Results: {}", path.display());
    let duration = match (log.start, log.finish) {
        (Some(s), Some(f)) => Duration::from_secs_f64((f - s).max(0.0)),
        _ => Duration::ZERO,
    };
    let finished = log.is_finished();
    let result = RunResult::from_tests(log.into_test_list(), duration, !finished);
    print_summary(&result, true);
    std::process::exit(result.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    match load_run_config(config_path) {
        Ok((config, _)) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Manifest: {}", config.vvrun.manifest.display());
            println!("  Results dir: {}", config.vvrun.results_dir.display());
            match config.vvrun.num_procs {
                Some(n) => println!("  Processors: {}", n),
                None => println!("  Processors: all"),
            }
            println!("  Devices: {}", config.vvrun.num_devices);
            println!("  Batch: {}", if config.batch.enabled { "yes" } else { "no" });

            let adapter_name = match &config.batch.adapter {
                AdapterConfig::Slurm(_) => "slurm",
                AdapterConfig::Local(_) => "local",
                AdapterConfig::Shell(_) => "shell",
            };
            println!("  Adapter: {}", adapter_name);
            println!("  Batch length: {}s", config.batch.batch_length);
            println!("  Max jobs: {}", config.batch.max_jobs);

            match load_manifest(&config.vvrun.manifest) {
                Ok(tests) => println!("  Tests: {}", tests.len()),
                Err(e) => println!("  Tests: manifest not loadable ({:#})", e),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config::INIT_TEMPLATE)?;
    println!("Created {}", path.display());
    println!();
    println!("List your tests in tests.toml, then run:");
    println!("  vvrun run");

    Ok(())
}

fn create_reporter(config: &Config, verbose: bool) -> MultiReporter {
    MultiReporter::new().with_reporter(
        ConsoleReporter::new(verbose)
            .with_progress(config.report.show_progress)
            .with_test_list(config.report.list_tests),
    )
}
