// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker Client Abstraction
//!
//! The minimal operation set the coordinator needs from an AMQP channel.
//! The harness works against any transport that implements [`BrokerClient`];
//! [`crate::memory::MemoryBroker`] is the in-process implementation.
//!
//! # Integration
//!
//! ```ignore
//! impl BrokerClient for AmqpChannel {
//!     fn start_consumer(&self, consumer_tag: &str, options: ConsumerOptions,
//!                       events: Arc<dyn ConsumerEvents>) -> StartConsumerFuture {
//!         // basic.qos(prefetch_count) + basic.consume with {"x-priority": priority}
//!     }
//!     // ...
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed")]
    Closed,
}

/// Arguments of a consume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Consumer priority argument; higher priority consumers receive first.
    pub priority: i32,
    /// Per-consumer prefetch window.
    pub prefetch_count: u16,
}

/// Completes once the broker confirmed the subscription.
pub type StartConsumerFuture = Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>>;

/// Events raised by the broker for one consumer.
///
/// `on_received` and `on_cancelled` are never invoked concurrently.
pub trait ConsumerEvents: Send + Sync {
    /// A message was delivered.
    fn on_received(&self, delivery_tag: u64, body: Vec<u8>);

    /// The broker confirmed the consumer cancel.
    fn on_cancelled(&self);

    /// The channel or connection failed.
    fn on_failed(&self, error: BrokerError);
}

/// Broker channel operations used by the coordinator.
pub trait BrokerClient: Send + Sync {
    /// Subscribe to the queue with the given consumer tag.
    fn start_consumer(
        &self,
        consumer_tag: &str,
        options: ConsumerOptions,
        events: Arc<dyn ConsumerEvents>,
    ) -> StartConsumerFuture;

    /// Acknowledge one delivery.
    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject and requeue a delivery, or every unsettled delivery up to it.
    fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// Request a consumer cancel; `on_cancelled` follows the confirmation.
    fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Release the channel. Idempotent.
    fn dispose(&self);
}

/// Build a consumer tag unique to this host and generation.
pub fn consumer_tag() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("message_picker_{}_{}", host, uuid::Uuid::new_v4().simple())
}
