use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::app_state::AppState;
use crate::audit::AuditLog;
use crate::config::AppConfig;

/// Top-level CLI interface for the sentiment control loop
#[derive(Parser)]
#[command(
    name = "sentiment_loop",
    version,
    about = "Sentiment serving with a monitoring and retraining control loop"
)]
pub struct Cli {
    /// Path to a TOML config file (defaults to sentiment_loop.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and run the periodic control loop
    Serve {
        /// Host/IP to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Serve predictions only, without the background loop
        #[arg(long)]
        no_loop: bool,
    },

    /// Run one monitoring cycle and print the snapshot
    Monitor,

    /// Monitor, evaluate the trigger and retrain if it fires
    Retrain,

    /// Re-activate an archived model version
    Rollback {
        #[arg(short, long)]
        version: String,
    },

    /// List every registered model version
    Models,

    /// Score a text with the active model
    Predict {
        text: String,
        /// Allow the input and prediction to be logged
        #[arg(long)]
        consent: bool,
    },

    /// Record feedback for a logged prediction
    Feedback {
        #[arg(long)]
        prediction_id: u64,
        #[arg(long, action = clap::ArgAction::Set)]
        correct: bool,
    },

    /// Verify the audit log hash chain
    VerifyAudit,
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(command: Commands, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Commands::VerifyAudit => {
            let audit = AuditLog::open(&config.audit_log_path)?;
            let lines = audit
                .verify_chain()
                .with_context(|| format!("audit log {}", audit.path().display()))?;
            println!("audit chain intact: {lines} events");
            Ok(())
        }
        Commands::Serve {
            host,
            port,
            no_loop,
        } => serve(config, host, port, no_loop).await,
        other => {
            let state = AppState::open(config).context("failed to open runtime state")?;
            let result = dispatch(other, &state).await;
            state.store.flush().context("failed to flush feedback log")?;
            result
        }
    }
}

async fn dispatch(command: Commands, state: &AppState) -> anyhow::Result<()> {
    match command {
        Commands::Monitor => print_json(&state.control.run_monitoring_cycle()),
        Commands::Retrain => print_json(&state.control.run_retraining_if_triggered().await),
        Commands::Rollback { version } => {
            let active = state.control.rollback(&version)?;
            println!("{} is now ACTIVE", active.version);
            Ok(())
        }
        Commands::Models => print_json(&state.registry.versions()?),
        Commands::Predict { text, consent } => print_json(&state.predictions.predict(&text, consent)?),
        Commands::Feedback {
            prediction_id,
            correct,
        } => {
            state.predictions.record_feedback(prediction_id, correct)?;
            println!("feedback recorded for prediction {prediction_id}");
            Ok(())
        }
        Commands::Serve { .. } | Commands::VerifyAudit => Ok(()),
    }
}

async fn serve(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
    no_loop: bool,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = Arc::new(AppState::open(config).context("failed to open runtime state")?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handle = if no_loop {
        None
    } else {
        Some(tokio::spawn(state.control.clone().run(shutdown_rx)))
    };

    let app = crate::web::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("HTTP server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = loop_handle {
        handle.await.context("control loop task panicked")?;
    }
    state.store.flush().context("failed to flush feedback log")?;
    tracing::info!("feedback log flushed, shutdown complete");
    Ok(())
}
