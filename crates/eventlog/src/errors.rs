// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::message::EventLogMessage;

/// Failures turning a raw ingestion payload into an [`EventLogMessage`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unable to parse an empty message")]
    Empty,

    #[error("message of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("malformed message: {source}")]
    Malformed {
        source: serde_json::Error,
        garbage: Box<EventLogMessage>,
    },

    #[error("message has no event_id")]
    MissingEventId(Box<EventLogMessage>),
}

impl DecodeError {
    /// The message to hand to the garbage sink, when there is anything worth keeping.
    pub fn into_garbage(self) -> Option<EventLogMessage> {
        match self {
            DecodeError::Malformed { garbage, .. } => Some(*garbage),
            DecodeError::MissingEventId(message) => Some(*message),
            DecodeError::Empty | DecodeError::TooLarge(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event {event_id} received more than {max} messages")]
    Overflow { event_id: String, max: u64 },

    #[error("message has no routing key")]
    MissingKey,

    #[error("unreadable monitor samples: {0}")]
    UnreadableSamples(serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("coordination store error: {0}")]
    Coordination(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cluster payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("instance {0} is not registered")]
    UnknownInstance(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("failed to bind web server: {0}")]
    Bind(std::io::Error),

    #[error("web server error: {0}")]
    Serve(std::io::Error),
}
