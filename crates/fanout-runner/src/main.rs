//! fanout: mesh vs relay fan-out benchmark runner.
//!
//! - Expands the configured dimensions (or a named suite) into a scenario matrix
//! - Applies `tc netem` impairment to the shared network path per scenario
//! - Drives presenter and viewer sessions through an external page driver,
//!   or an in-process simulation with `--simulate`
//! - Appends one CSV row per scenario as soon as it finishes

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use fanout_runner::config::{RunConfig, RunConfigInput};
use fanout_runner::context::Launcher;
use fanout_runner::context::process::ProcessLauncher;
use fanout_runner::context::simulated::SimLauncher;
use fanout_runner::controller::{RunController, ScenarioExecutor};
use fanout_runner::session::SessionOrchestrator;
use fanout_runner::sink::CsvSink;
use fanout_runner::util::check_tcp_reachable;
use fanout_sim::impairment::{DryRunShaper, ImpairmentController, Shaper, TcNetem};
use fanout_sim::matrix;
use fanout_sim::suites::Suite;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Mesh vs relay fan-out benchmark runner.
#[derive(Parser, Debug)]
#[command(name = "fanout", about = "Compare mesh and relay fan-out under network impairment")]
struct Cli {
    /// TOML run configuration. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Result CSV path (overrides config and FANOUT_RESULTS).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Run sessions in-process instead of through the page driver.
    /// Impairment commands are logged, not executed.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Run a named fixed suite (quick, scaling, lossy) instead of the matrix.
    #[arg(long)]
    suite: Option<Suite>,

    /// Print the generated scenarios and exit.
    #[arg(long, default_value_t = false)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut input = match &cli.config {
        Some(path) => RunConfigInput::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RunConfigInput::default(),
    };
    if let Some(suite) = cli.suite {
        input.scenarios.clear();
        input.suite = Some(suite);
    }
    let mut config = input.resolve().context("invalid configuration")?;
    if let Some(output) = cli.output {
        config.output = output;
    }

    let scenarios = matrix::build(&config.source).context("cannot build scenario matrix")?;
    if cli.list {
        for (i, s) in scenarios.iter().enumerate() {
            println!("{:>4}  {s}  ({} ms)", i + 1, s.duration().as_millis());
        }
        return Ok(());
    }

    let estimated: Duration = scenarios.iter().map(|s| s.duration()).sum();
    tracing::info!(
        scenarios = scenarios.len(),
        estimated_secs = estimated.as_secs(),
        simulate = cli.simulate,
        base_url = %config.entry_point.base_url,
        output = %config.output.display(),
        "fanout starting"
    );

    let launcher = build_launcher(&config, cli.simulate).await?;
    let shaper = build_shaper(&config, cli.simulate);
    let sink = CsvSink::open(&config.output)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, finishing current scenario then stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    let orchestrator = SessionOrchestrator::new(launcher, config.entry_point, config.timing);
    let mut controller = RunController::new(
        ScenarioExecutor::new(orchestrator),
        ImpairmentController::new(shaper),
        sink,
        shutdown_rx,
    );
    let report = controller.run(&scenarios).await?;

    tracing::info!(
        run_id = %report.run_id,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        output = %config.output.display(),
        "fanout finished"
    );
    Ok(())
}

/// Failing to create execution contexts is the one fatal startup error.
async fn build_launcher(config: &RunConfig, simulate: bool) -> anyhow::Result<Launcher> {
    if simulate {
        return Ok(Launcher::Simulated(SimLauncher::new(
            config.simulate.clone(),
            config.entry_point.clone(),
        )));
    }

    let launcher = Launcher::Process(ProcessLauncher::new(config.driver.clone()));
    launcher
        .preflight()
        .context("cannot create execution contexts")?;

    if !check_tcp_reachable(&config.entry_point.base_url, Duration::from_secs(3)).await {
        tracing::warn!(
            base_url = %config.entry_point.base_url,
            "entry point not reachable, sessions will likely fail"
        );
    }
    Ok(launcher)
}

fn build_shaper(config: &RunConfig, simulate: bool) -> Box<dyn Shaper> {
    let path = config.impairment.path.clone();
    if simulate || !config.impairment.enabled {
        tracing::info!(
            interface = %path.interface,
            "impairment in dry-run mode, tc commands are logged only"
        );
        return Box::new(DryRunShaper::new(path));
    }
    Box::new(TcNetem::new(path))
}
