//! Randomness relay
//!
//! Off-chain service that watches a VRF-style coordinator contract for
//! randomness requests and fulfills them with seeds from the operating
//! system CSPRNG. Two deployments usually run side by side:
//!
//! - **Immediate** fulfills requests as soon as they are observed.
//! - **Delay** polls slower and only acts on requests the immediate
//!   instance has left unfulfilled for `DELAY_BLOCKS` blocks.
//!
//! The coordinator contract is the only source of truth; neither instance
//! coordinates with the other. An optional WebSocket log subscription
//! (`WSS_ENDPOINT`) cuts detection latency; polling keeps running beside it.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod abi;
mod chain;
mod chains;
mod config;
mod cursor;
mod dedup;
mod error;
mod fulfiller;
mod keys;
mod metrics;
mod nonce;
mod notify;
mod randomness;
mod reader;
mod relay;
mod request;
mod rpc;
mod subscribe;
mod tx;

#[cfg(test)]
mod test_support;

use chain::CoordinatorChain;
use config::AppConfig;
use cursor::CursorStore;
use dedup::DedupCoordinator;
use error::FatalError;
use fulfiller::FulfillmentSubmitter;
use metrics::RelayMetrics;
use notify::{AlertSink, Severity, WebhookNotifier};
use randomness::{OsRandomness, RandomnessSource};
use reader::ChainReader;
use relay::Relay;
use rpc::RpcClient;
use subscribe::LogSubscriber;

const LIVE_EVENT_BUFFER: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "randomness-relay", version, about = "Fulfills on-chain randomness requests")]
struct Cli {
    /// Dotenv file to load before reading the environment. Variables
    /// already set in the process take precedence.
    #[arg(long, value_name = "PATH", default_value = ".env")]
    dotenv: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let dotenv = dotenvy::from_path(&cli.dotenv);

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!(path = %cli.dotenv.display(), error = %e, "Failed to load dotenv file");
        }
    }

    match run().await {
        Ok(()) => {
            info!("Relay stopped");
            ExitCode::SUCCESS
        }
        Err(fatal) => {
            error!(error = %fatal, code = fatal.exit_code(), "Relay exiting");
            ExitCode::from(fatal.exit_code())
        }
    }
}

/// Load configuration, alerting on failure.
async fn load_config(
    lookup: impl Fn(&str) -> Option<String>,
    alerts: &dyn AlertSink,
) -> Result<AppConfig, FatalError> {
    match AppConfig::from_lookup(lookup) {
        Ok(config) => Ok(config),
        Err(e) => {
            alerts
                .notify(Severity::Critical, &format!("Configuration error: {e:#}"))
                .await;
            Err(FatalError::Configuration(e))
        }
    }
}

async fn run() -> Result<(), FatalError> {
    // Until the config is loaded, alerts go to whatever hook the
    // environment names.
    let bootstrap_alerts = WebhookNotifier::new(std::env::var("ALERT_HOOK_URL").ok(), "randomness-relay")
        .map_err(FatalError::Configuration)?;
    let config = load_config(|key| std::env::var(key).ok(), &bootstrap_alerts).await?;

    let label = config.label();
    let alerts: Arc<dyn AlertSink> = Arc::new(
        WebhookNotifier::new(config.alert_hook_url.clone(), label.clone())
            .map_err(FatalError::Configuration)?,
    );
    let sink = Arc::new(
        WebhookNotifier::new(config.fulfillment_hook_url.clone(), label.clone())
            .map_err(FatalError::Configuration)?,
    );

    let randomness: Arc<dyn RandomnessSource> = Arc::new(OsRandomness);
    if let Err(e) = randomness.generate() {
        alerts
            .notify(Severity::Critical, &format!("Entropy self-check failed: {e}"))
            .await;
        return Err(e.into());
    }

    info!(
        chain = %config.chain_name,
        chain_id = config.chain_id,
        coordinator = %config.coordinator,
        sender = %config.wallet.address(),
        role = %config.role,
        delay_blocks = config.delay_blocks,
        "Starting randomness relay"
    );
    info!(endpoints = ?config.rpc_urls, state = %config.state_path.display(), "Endpoints configured");

    let chain: Arc<dyn CoordinatorChain> = Arc::new(
        RpcClient::new(
            config.rpc_urls.clone(),
            config.coordinator,
            config.rpc_timeout,
            config.send_timeout,
        )
        .map_err(FatalError::Configuration)?,
    );

    let store = CursorStore::new(config.state_path.clone(), config.chain_id, config.coordinator);
    let reader = ChainReader::new(Arc::clone(&chain), store, Arc::clone(&alerts), config.scan_settings());
    let dedup = DedupCoordinator::new(config.claim_ttl, config.max_attempts);
    let submitter = Arc::new(FulfillmentSubmitter::new(
        chain,
        config.wallet.clone(),
        config.submit_settings(),
        config.role,
        sink,
    ));
    let relay = Relay::new(
        config.loop_settings(),
        reader,
        dedup,
        randomness,
        submitter,
        Arc::clone(&alerts),
        Arc::new(RelayMetrics::new()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut relay = match &config.wss_endpoint {
        Some(url) => {
            info!("Live log subscription enabled");
            let (events_tx, events_rx) = mpsc::channel(LIVE_EVENT_BUFFER);
            let subscriber = LogSubscriber::new(url.clone(), config.coordinator, Arc::clone(&alerts));
            tokio::spawn(subscriber.run(events_tx, shutdown_rx.clone()));
            relay.with_live_events(events_rx)
        }
        None => relay,
    };

    alerts
        .notify(
            Severity::Info,
            &format!("Relay started from {} as {}", config.wallet.address(), config.role),
        )
        .await;

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    relay.run(shutdown_rx).await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
