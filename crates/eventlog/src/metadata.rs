// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the external store of operation (event) records.
//!
//! Log ingestion only touches it from the barrel-event consumer and the daily
//! cleanup, never on the ingestion path.

use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub status: String,
    pub final_status: String,
    pub message: String,
    pub code_version: Option<String>,
    pub start_time: OffsetDateTime,
    pub end_time: Option<String>,
}

impl EventRecord {
    pub fn new(event_id: impl Into<String>, start_time: OffsetDateTime) -> Self {
        Self {
            event_id: event_id.into(),
            status: String::new(),
            final_status: String::new(),
            message: String::new(),
            code_version: None,
            start_time,
            end_time: None,
        }
    }
}

#[async_trait]
pub trait EventRecordStore: Send + Sync {
    async fn get(&self, event_id: &str) -> Result<Option<EventRecord>, StoreError>;

    async fn update(&self, record: EventRecord) -> Result<(), StoreError>;

    /// Deletes records started before `cutoff`, returning how many were removed.
    async fn delete_before(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError>;
}

/// Process-local record store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryEventRecordStore {
    records: RwLock<HashMap<String, EventRecord>>,
}

impl MemoryEventRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: EventRecord) {
        self.records.write().insert(record.event_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl EventRecordStore for MemoryEventRecordStore {
    async fn get(&self, event_id: &str) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.records.read().get(event_id).cloned())
    }

    async fn update(&self, record: EventRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        match records.get_mut(&record.event_id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::Metadata(format!(
                "event {} does not exist",
                record.event_id
            ))),
        }
    }

    async fn delete_before(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.start_time >= cutoff);
        Ok(before - records.len())
    }
}
