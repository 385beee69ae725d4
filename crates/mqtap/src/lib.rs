// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqtap - Message Queue Test Harness
//!
//! Attaches to a queue as a stealing consumer with elevated priority,
//! intercepts the messages a test is waiting for, runs them through a
//! processing callback and settles every delivery it saw: acknowledged when
//! processed, rejected (requeued for the regular consumers) otherwise.
//!
//! # Features
//!
//! - **Priority stealing**: one consumer generation per burst of waits
//! - **Exactly-once settlement**: a ledger decides batch and single rejects
//!   across consumer restarts on the same channel
//! - **Deferred deadlines**: the timeout of a wait starts when it is awaited
//! - **Diagnostics**: timeouts carry samples of what was seen instead
//! - **Drain waits**: block until a queue is empty
//!
//! # Quick Start
//!
//! ```ignore
//! use mqtap::{HarnessSettings, MemoryBroker, ProcessingCoordinator};
//! use std::sync::Arc;
//!
//! #[derive(Clone, serde::Deserialize)]
//! struct Order { id: u32 }
//!
//! let broker = Arc::new(MemoryBroker::new());
//! let harness = ProcessingCoordinator::new(
//!     "orders",
//!     broker.clone(),
//!     HarnessSettings::default(),
//!     |order: Order| async move { handle(order).await },
//! );
//!
//! let pending = harness.wait_for("order 7", |o: &Order| o.id == 7).await?;
//! broker.publish(r#"{"id":7}"#);
//! let order = pending.await?;
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! timeout_ms = 5000
//! priority = 10
//! prefetch_count = 10000
//! ```

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod memory;
pub mod pending;
pub mod report;
pub mod waiter;

pub use broker::{BrokerClient, BrokerError, ConsumerEvents, ConsumerOptions};
pub use config::{ConfigError, HarnessSettings};
pub use coordinator::{Message, ProcessingCoordinator};
pub use drain::{DrainWaiter, QueueDepth};
pub use error::{HarnessError, HarnessResult};
pub use generation::GenerationState;
pub use ledger::{compute_nacks, AckLedger, NackPlan, Settlement};
pub use memory::{BrokerOperation, MemoryBroker};
pub use pending::PendingMessage;
pub use report::{TimeoutReason, TimeoutReport};

#[cfg(feature = "management-api")]
pub use drain::ManagementQueueDepth;
