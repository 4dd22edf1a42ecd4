// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use eventlog::logger::Formatter;
use eventlog_core::{EventLogConfig, EventLogServices};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = std::env::var("EVENTLOG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,tungstenite=off,{}", log_level);

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match EventLogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let handle = match EventLogServices::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error when starting event log services: {}", e);
            return ExitCode::FAILURE;
        }
    };

    shutdown_signal().await;
    info!("Shutdown signal received");
    if let Err(e) = handle.stop().await {
        error!("Error when stopping event log services: {}", e);
        return ExitCode::FAILURE;
    }
    handle.stopped().await;
    info!("Event log services stopped");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
