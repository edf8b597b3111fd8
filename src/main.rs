use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use launchpatch::engine::models::FileOutcome;
use launchpatch::{Availability, Module, OperationReport, PatchConfig, PatchEngine, ProgressEvent};

#[derive(Parser, Debug)]
#[command(
    name = "launchpatch",
    author,
    version,
    about = "Install, update and repair launcher and game content from a patch server"
)]
struct Cli {
    /// JSON config file. Defaults apply to every key except the remote address.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Patch server root, e.g. `https://cdn.example.com` or `ftp://files.example.com`.
    #[arg(long)]
    remote: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every file listed in the module's manifest.
    Install { module: Module },
    /// Download only what changed since the last manifest.
    Update { module: Module },
    /// Hash installed files and redownload broken ones.
    Verify { module: Module },
    /// Report server availability and whether modules are out of date.
    Check {
        /// Check a single module instead of both.
        module: Option<Module>,
    },
    /// Print the launcher changelog.
    Changelog,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(&cli)?;
    info!(
        "launchpatch {} talking to {} ({})",
        env!("CARGO_PKG_VERSION"),
        config.remote_address,
        config.system_target
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let engine = PatchEngine::from_config(config, Arc::new(tx))?;
    let renderer = render_progress(rx);

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current chunk");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let outcome = execute(&engine, cli.command).await;
    drop(engine);
    let _ = renderer.await;
    outcome
}

fn load_config(cli: &Cli) -> Result<PatchConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => PatchConfig::from_json_file(path)?,
        None => {
            let remote = cli
                .remote
                .as_deref()
                .ok_or("either --config or --remote is required")?;
            let provider = [("RemoteAddress".to_owned(), remote.to_owned())]
                .into_iter()
                .collect::<std::collections::HashMap<_, _>>();
            PatchConfig::from_provider(&provider)?
        }
    };
    if cli.config.is_some()
        && let Some(remote) = &cli.remote
    {
        config.remote_address = remote.trim_end_matches('/').to_owned();
    }
    Ok(config)
}

async fn execute(engine: &PatchEngine, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Install { module } => print_report(&engine.install(module).await?),
        Command::Update { module } => print_report(&engine.update(module).await?),
        Command::Verify { module } => print_report(&engine.verify(module).await?),
        Command::Check { module } => {
            let modules = module.map_or(Module::ALL.to_vec(), |module| vec![module]);
            for module in modules {
                let availability = engine.check_availability(module).await;
                println!("{module}: {}", availability_label(availability));
                if availability == Availability::Ready {
                    let outdated = engine.is_module_outdated(module).await?;
                    println!(
                        "{module}: {}",
                        if outdated { "update available" } else { "up to date" }
                    );
                }
            }
        }
        Command::Changelog => println!("{}", engine.changelog().await?),
    }
    Ok(())
}

fn availability_label(availability: Availability) -> &'static str {
    match availability {
        Availability::Ready => "server ready",
        Availability::Unreachable => "server unreachable",
        Availability::PlatformUnsupported => "no build for this platform",
    }
}

fn print_report(report: &OperationReport) {
    println!(
        "{} {}: {} downloaded, {} skipped, {} repaired, {} bytes transferred",
        report.operation,
        report.module,
        report.downloaded,
        report.skipped,
        report.repaired,
        report.bytes
    );
}

/// Draw a per-file bar until the engine drops its end of the channel.
fn render_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let style = ProgressStyle::with_template(
            "{msg:40!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
        )
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = ProgressBar::hidden();
        bar.set_style(style);

        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::OperationStarted {
                    module,
                    operation,
                    total_files,
                } => {
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    bar.println(format!("{operation} {module}: {total_files} file(s)"));
                }
                ProgressEvent::FileStarted {
                    file,
                    index,
                    total_files,
                    size,
                    ..
                } => {
                    bar.reset();
                    bar.set_length(size);
                    bar.set_message(format!("[{}/{}] {}", index + 1, total_files, file));
                }
                ProgressEvent::Bytes { downloaded, .. } => bar.set_position(downloaded),
                ProgressEvent::FileFinished {
                    file,
                    outcome: FileOutcome::Downloaded { resumed_from, .. },
                    ..
                } if resumed_from > 0 => {
                    bar.println(format!("{file}: resumed from byte {resumed_from}"));
                }
                ProgressEvent::FileFinished { .. } => {}
                ProgressEvent::FileBroken { file, .. } => bar.println(format!("broken: {file}")),
                ProgressEvent::OperationFinished { .. } => bar.finish_and_clear(),
            }
        }
    })
}
