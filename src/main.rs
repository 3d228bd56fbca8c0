use crate::cli::Cli;
use crate::config::{Config, ConfigError};
use crate::ecr::AwsEcr;
use crate::reconciler::Reconciler;
use crate::registry::RegistryGateway;
use crate::watcher::{PodWatcher, WatchSettings};
use anyhow::Context;
use clap::{CommandFactory, Parser};
use std::process::ExitCode;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod ecr;
mod error;
mod image_reference;
mod reconciler;
mod registry;
mod state;
mod tag;
mod watcher;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const POD_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not errors
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(ConfigError::MissingTag) = e.downcast_ref::<ConfigError>() {
                error!("{}", e);
                let _ = Cli::command().print_help();
            } else {
                error!("{:?}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Starting kube-ecr-tagger {}", env!("CARGO_PKG_VERSION"));
    let config = Config::load(cli)?;

    let client = watcher::create_client(config.kubeconfig.as_deref())
        .await
        .context("Failed to create Kubernetes client")?;
    let ecr = AwsEcr::from_env()
        .await
        .context("Failed to create ECR client")?;
    let reconciler = Reconciler::new(RegistryGateway::new(ecr), &config);
    let listener = webserver::bind(config.webserver.port).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let (sender, receiver) = mpsc::channel(POD_QUEUE_CAPACITY);
    let (ready, synced) = watch::channel(false);

    let webserver = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = webserver::serve(listener, synced, cancel.clone()).await;
            // no health endpoints left, stop everything
            if result.is_err() {
                cancel.cancel();
            }
            result
        }
    });
    let reconciler = tokio::spawn({
        let cancel = cancel.clone();
        async move { reconciler.run(receiver, cancel).await }
    });

    let pod_watcher = PodWatcher::new(client, WatchSettings::from(&config));
    let watching = tokio::spawn(pod_watcher.run(sender, ready, cancel.clone()));
    let result = watching.await;

    cancel.cancel();
    reconciler.await?;
    let served = webserver.await?;
    result??;
    served.context("Webserver failed")?;

    info!("Shut down gracefully");
    Ok(())
}

async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
    cancel.cancel();
}
