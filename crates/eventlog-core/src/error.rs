// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors that can occur when running the event log services
#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Failed to start cluster: {0}")]
    ClusterStart(String),

    #[error("Services already started")]
    AlreadyStarted,

    #[error("Services not running")]
    NotRunning,

    #[error("Runtime error: {0}")]
    Runtime(String),
}
