use std::sync::Arc;

use clap::{Parser, Subcommand};
use fedsa_validator::{
    config::AppConfig,
    credentials::{CredentialStore, KubeSecretBackend, NoopBackend, SecretBackend},
    k8s_client,
    renewer,
    tokenreview::{self, AppState},
    verifier::VerifierManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(version, about, arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the validator, serving TokenReview requests and renewing credentials
    Serve,

    /// Load configuration and print it, then exit, for debugging deployments
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::from("info"))
        .init();

    info!("fedsa-validator v{VERSION}");

    match Cli::parse().command {
        Some(Command::Serve) => serve().await?,
        Some(Command::PrintConfig) => {
            let config = AppConfig::load()?;
            println!("{config:#?}");
        }
        None => {}
    }

    Ok(())
}

async fn secret_backend(config: &AppConfig) -> Box<dyn SecretBackend> {
    match k8s_client::local_client().await {
        Ok(client) => Box::new(KubeSecretBackend::new(
            client,
            config.credentials_secret_name.clone(),
            config.credentials_secret_namespace.clone(),
        )),
        Err(err) => {
            warn!(%err, "no in-cluster Kubernetes client available, credentials will not persist");
            Box::new(NoopBackend::default())
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    let store = Arc::new(CredentialStore::new(secret_backend(&config).await).await?);
    for cluster in &config.clusters {
        if let Some((token_path, ca_path)) = cluster.bootstrap_paths() {
            store.load_bootstrap_from_files(&cluster.name, token_path, ca_path)?;
        }
    }

    let verifiers = Arc::new(VerifierManager::new(config.clusters.clone(), store.clone()));

    let cancel = CancellationToken::new();
    let mut renewal_tasks = Vec::new();
    for cluster in &config.clusters {
        if !cluster.is_remote() {
            continue;
        }
        let handle = tokio::spawn(renewer::run(
            cluster.clone(),
            store.clone(),
            verifiers.clone(),
            config.renewal.clone(),
            cancel.clone(),
        ));
        renewal_tasks.push(handle);
    }

    let state = Arc::new(AppState { config: Arc::new(config.clone()), store, verifiers });
    let app = tokenreview::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr.as_str()).await?;
    info!(addr = %config.listen_addr, "listening");

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    for handle in renewal_tasks {
        handle.abort();
    }

    Ok(())
}
