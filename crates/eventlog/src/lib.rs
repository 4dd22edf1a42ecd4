// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log and event aggregation engine.
//!
//! Producers stream operation logs, container stdout and monitor samples into
//! the [`entry`] listeners. The [`store::manager::StoreManager`] decodes them
//! into per-key barrels that persist, analyse and fan out to WebSocket
//! subscribers served by [`web`]. In cluster mode, [`cluster`] replicates every
//! locally ingested message to peers and routes container-log producers to the
//! least-loaded node.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod cluster;
pub mod constants;
pub mod entry;
pub mod errors;
pub mod file_store;
pub mod logger;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod store;
pub mod web;
