//! Container daemon binary. Also hosts the sandbox init entry: the daemon
//! re-executes itself with a sentinel argument to become a container's
//! init process.

mod gc;
mod protocol;
mod server;
mod service;

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use chef_common::settings::CvdSettings;
use chef_lsm::PathPolicyManager;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use service::CvdService;

#[derive(Parser)]
#[command(name = "cvd", version, about = "chef container daemon")]
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
    // The init re-exec path must run before any daemon setup.
    #[cfg(target_os = "linux")]
    if std::env::args().nth(1).as_deref() == Some(chef_container::sandbox::INIT_SENTINEL) {
        chef_container::sandbox::init_main();
    }

    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .init();

    let settings = CvdSettings::load().context("loading cvd.json")?;
    info!(address = %settings.api_address, "cvd starting");

    std::fs::create_dir_all(&settings.work_root)
        .with_context(|| format!("creating work root {}", settings.work_root.display()))?;

    let report = gc::sweep(&settings.work_root);
    if !report.errors.is_empty() {
        warn!(errors = report.errors.len(), "startup sweep left debris behind");
    }

    let lsm = PathPolicyManager::new();
    if !lsm.available() {
        info!("path policy enforcement disabled on this kernel");
    }
    let service = Rc::new(RefCell::new(CvdService::new(
        settings.security.clone(),
        settings.work_root.clone(),
        lsm,
    )));

    let listener = server::bind_api_socket(&settings.api_address)?;
    let shutdown = CancellationToken::new();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting the event loop")?;
    let local = tokio::task::LocalSet::new();
    let serve_service = Rc::clone(&service);
    runtime.block_on(local.run_until(async {
        let signal_token = shutdown.clone();
        tokio::task::spawn_local(async move {
            wait_for_shutdown().await;
            info!("shutdown signal received");
            signal_token.cancel();
        });
        server::serve(listener, serve_service, shutdown.clone()).await
    }))?;

    service.borrow_mut().shutdown();
    info!("cvd stopped");
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
