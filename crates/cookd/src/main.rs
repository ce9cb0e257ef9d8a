//! Cook daemon binary: accepts build jobs from the orchestrator and bakes
//! them in containers.

use std::sync::Arc;

use anyhow::{Context, Result};
use chef_common::settings::CookdSettings;
use chef_lsm::PathPolicyManager;
use clap::Parser;
use cookd::collaborators::{CommandFetcher, LocalArtifactStore, LocalFridge};
use cookd::executor::{BuildExecutor, ExecutorDeps};
use cookd::logsink::{BuildLogFanout, BuildLogLayer};
use cookd::queue::WorkerPool;
use cookd::server::{self, WireNotifier};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cookd", version, about = "chef build worker daemon")]
struct Cli {
    /// Raise the log level; repeat for more detail.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn log_filter(verbose: u8) -> EnvFilter {
    let directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fanout = BuildLogFanout::new();
    tracing_subscriber::registry()
        .with(log_filter(cli.verbose))
        .with(tracing_subscriber::fmt::layer())
        .with(BuildLogLayer::new(Arc::clone(&fanout)))
        .init();

    let settings = CookdSettings::load().context("loading cookd.json")?;
    info!(address = %settings.api_address, builders = settings.builders, "cookd starting");

    std::fs::create_dir_all(&settings.build_root)
        .with_context(|| format!("creating build root {}", settings.build_root.display()))?;

    let notifier = Arc::new(WireNotifier::default());
    let executor = BuildExecutor::new(
        ExecutorDeps {
            notifier: Arc::clone(&notifier) as _,
            fridge: Arc::new(LocalFridge::new(&settings.fridge)),
            fetcher: Arc::new(CommandFetcher),
            artifacts: Arc::new(LocalArtifactStore::new(&settings.artifacts)),
            fanout,
        },
        settings.clone(),
        PathPolicyManager::new(),
    );

    let pool = WorkerPool::start(settings.builders, Arc::new(executor));
    let queue = pool.handle();

    let listener = server::bind_api_socket(&settings.api_address)?;
    let shutdown = CancellationToken::new();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting the intake runtime")?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(async {
        let signal_token = shutdown.clone();
        tokio::task::spawn_local(async move {
            wait_for_shutdown().await;
            info!("shutdown signal received");
            signal_token.cancel();
        });
        server::serve(listener, queue, notifier, shutdown.clone()).await
    }))?;

    // Drain: in-flight builds run to completion.
    pool.shutdown();
    info!("cookd stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!(error = %e, "no SIGTERM handler, falling back to ctrl-c");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "ctrl_c handler error");
                }
                return;
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "ctrl_c handler error");
                }
            }
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c handler error");
        }
    }
}
