// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory broker.
//!
//! A strict single-queue, single-channel broker used by tests and the
//! simulator. Delivery tags increase for the lifetime of the broker, the
//! highest-priority consumer receives each publish, and messages published
//! while no consumer is attached go to the backup consumers (the backlog).
//! Settling a tag that was never delivered or is already settled is recorded
//! as a violation and fails the call.

use crate::broker::{
    BrokerClient, BrokerError, ConsumerEvents, ConsumerOptions, StartConsumerFuture,
};
use crate::drain::{DepthFuture, QueueDepth};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Operation issued against the broker, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOperation {
    StartConsumer { consumer_tag: String, priority: i32 },
    Ack(u64),
    Nack { delivery_tag: u64, multiple: bool },
    Cancel(String),
    /// Recorded once the consumer's cancel handler returned.
    CancelConfirmed(String),
    Dispose,
}

struct MemoryConsumer {
    consumer_tag: String,
    options: ConsumerOptions,
    events: Arc<dyn ConsumerEvents>,
}

#[derive(Default)]
struct MemoryState {
    last_tag: u64,
    consumers: Vec<MemoryConsumer>,
    /// Delivered, unsettled bodies by tag.
    unsettled: BTreeMap<u64, Vec<u8>>,
    acked: Vec<u64>,
    nacked: Vec<u64>,
    backlog: Vec<Vec<u8>>,
    operations: Vec<BrokerOperation>,
    violations: Vec<String>,
    hold_cancellations: bool,
    held: Vec<MemoryConsumer>,
    disposed: bool,
}

/// In-process broker implementing [`BrokerClient`].
pub struct MemoryBroker {
    /// Serializes consumer callbacks.
    dispatch: Mutex<()>,
    state: Mutex<MemoryState>,
    confirmed_cancels: watch::Sender<usize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (confirmed_cancels, _) = watch::channel(0);
        Self {
            dispatch: Mutex::new(()),
            state: Mutex::new(MemoryState::default()),
            confirmed_cancels,
        }
    }

    /// Publish a message; returns the delivery tag when a consumer received it.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Option<u64> {
        let _dispatch = self.dispatch.lock();
        self.deliver(body.into())
    }

    /// Publish several messages without interleaving consumer cancels.
    pub fn publish_all<I, B>(&self, bodies: I) -> Vec<Option<u64>>
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let _dispatch = self.dispatch.lock();
        bodies
            .into_iter()
            .map(|body| self.deliver(body.into()))
            .collect()
    }

    /// Publish a value serialized as JSON.
    pub fn publish_json<T: serde::Serialize>(&self, value: &T) -> Option<u64> {
        match serde_json::to_vec(value) {
            Ok(body) => self.publish(body),
            Err(err) => {
                tracing::warn!("memory broker: cannot serialize message: {}", err);
                None
            }
        }
    }

    fn deliver(&self, body: Vec<u8>) -> Option<u64> {
        let (delivery_tag, events) = {
            let mut state = self.state.lock();
            let target = state
                .consumers
                .iter()
                .enumerate()
                .max_by_key(|(index, consumer)| {
                    (consumer.options.priority, std::cmp::Reverse(*index))
                })
                .map(|(_, consumer)| Arc::clone(&consumer.events));
            match target {
                Some(events) => {
                    state.last_tag += 1;
                    let delivery_tag = state.last_tag;
                    state.unsettled.insert(delivery_tag, body.clone());
                    (delivery_tag, events)
                }
                None => {
                    state.backlog.push(body);
                    return None;
                }
            }
        };
        events.on_received(delivery_tag, body);
        Some(delivery_tag)
    }

    /// Keep cancel confirmations back until [`release_cancellations`](Self::release_cancellations).
    pub fn hold_cancellations(&self) {
        self.state.lock().hold_cancellations = true;
    }

    /// Confirm every held cancel.
    pub fn release_cancellations(&self) {
        let _dispatch = self.dispatch.lock();
        let held = {
            let mut state = self.state.lock();
            state.hold_cancellations = false;
            std::mem::take(&mut state.held)
        };
        for consumer in held {
            self.confirm_cancel(consumer);
        }
    }

    fn confirm_cancel(&self, consumer: MemoryConsumer) {
        consumer.events.on_cancelled();
        self.state
            .lock()
            .operations
            .push(BrokerOperation::CancelConfirmed(consumer.consumer_tag));
        self.confirmed_cancels.send_modify(|count| *count += 1);
    }

    /// Wait until at least `count` cancels were confirmed.
    pub async fn cancellations(&self, count: usize) {
        let mut rx = self.confirmed_cancels.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _closed = rx.wait_for(|confirmed| *confirmed >= count).await;
    }

    /// Report a channel failure to every attached consumer.
    pub fn fail_connection(&self, reason: &str) {
        let _dispatch = self.dispatch.lock();
        let consumers: Vec<Arc<dyn ConsumerEvents>> = {
            let state = self.state.lock();
            state
                .consumers
                .iter()
                .map(|consumer| Arc::clone(&consumer.events))
                .collect()
        };
        for events in consumers {
            events.on_failed(BrokerError::Connection(reason.to_string()));
        }
    }

    /// Messages the backup consumers hold, requeued rejects included.
    pub fn backlog(&self) -> Vec<Vec<u8>> {
        self.state.lock().backlog.clone()
    }

    /// Let the backup consumers take up to `count` backlog messages.
    pub fn consume_backlog(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        let taken = count.min(state.backlog.len());
        state.backlog.drain(..taken);
        taken
    }

    pub fn operations(&self) -> Vec<BrokerOperation> {
        self.state.lock().operations.clone()
    }

    /// Acknowledged tags in settlement order.
    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().acked.clone()
    }

    /// Rejected tags in settlement order.
    pub fn nacked(&self) -> Vec<u64> {
        self.state.lock().nacked.clone()
    }

    /// Delivered tags that are neither acked nor nacked.
    pub fn unsettled(&self) -> Vec<u64> {
        self.state.lock().unsettled.keys().copied().collect()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.disposed {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn violation(&mut self, message: String) -> BrokerError {
        tracing::warn!("memory broker: {}", message);
        self.violations.push(message.clone());
        BrokerError::Protocol(message)
    }
}

impl BrokerClient for MemoryBroker {
    fn start_consumer(
        &self,
        consumer_tag: &str,
        options: ConsumerOptions,
        events: Arc<dyn ConsumerEvents>,
    ) -> StartConsumerFuture {
        let result = {
            let mut state = self.state.lock();
            state.check_open().map(|()| {
                state.operations.push(BrokerOperation::StartConsumer {
                    consumer_tag: consumer_tag.to_string(),
                    priority: options.priority,
                });
                state.consumers.push(MemoryConsumer {
                    consumer_tag: consumer_tag.to_string(),
                    options,
                    events,
                });
            })
        };
        Box::pin(std::future::ready(result))
    }

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.operations.push(BrokerOperation::Ack(delivery_tag));
        if state.unsettled.remove(&delivery_tag).is_none() {
            return Err(state.violation(format!("ack of unsettled-unknown tag {}", delivery_tag)));
        }
        state.acked.push(delivery_tag);
        Ok(())
    }

    fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.operations.push(BrokerOperation::Nack {
            delivery_tag,
            multiple,
        });
        if !state.unsettled.contains_key(&delivery_tag) {
            return Err(state.violation(format!(
                "nack of unsettled-unknown tag {} (multiple: {})",
                delivery_tag, multiple
            )));
        }
        let tags: Vec<u64> = if multiple {
            state.unsettled.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else {
            vec![delivery_tag]
        };
        for tag in tags {
            if let Some(body) = state.unsettled.remove(&tag) {
                state.nacked.push(tag);
                state.backlog.push(body);
            }
        }
        Ok(())
    }

    fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let _dispatch = self.dispatch.lock();
        let consumer = {
            let mut state = self.state.lock();
            state.check_open()?;
            state
                .operations
                .push(BrokerOperation::Cancel(consumer_tag.to_string()));
            let Some(index) = state
                .consumers
                .iter()
                .position(|consumer| consumer.consumer_tag == consumer_tag)
            else {
                return Err(state.violation(format!("cancel of unknown consumer {}", consumer_tag)));
            };
            let consumer = state.consumers.remove(index);
            if state.hold_cancellations {
                state.held.push(consumer);
                return Ok(());
            }
            consumer
        };
        self.confirm_cancel(consumer);
        Ok(())
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        if !state.disposed {
            state.disposed = true;
            state.operations.push(BrokerOperation::Dispose);
            state.consumers.clear();
            state.held.clear();
        }
    }
}

impl QueueDepth for MemoryBroker {
    fn message_count(&self) -> DepthFuture<'_> {
        let count = self.state.lock().backlog.len() as u64;
        Box::pin(std::future::ready(Ok(count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<u64>>,
        cancelled: Mutex<usize>,
        failed: Mutex<Vec<BrokerError>>,
    }

    impl ConsumerEvents for Recorder {
        fn on_received(&self, delivery_tag: u64, _body: Vec<u8>) {
            self.received.lock().push(delivery_tag);
        }

        fn on_cancelled(&self) {
            *self.cancelled.lock() += 1;
        }

        fn on_failed(&self, error: BrokerError) {
            self.failed.lock().push(error);
        }
    }

    fn options(priority: i32) -> ConsumerOptions {
        ConsumerOptions {
            priority,
            prefetch_count: 10,
        }
    }

    #[tokio::test]
    async fn test_priority_consumer_steals() {
        let broker = MemoryBroker::new();
        let low = Arc::new(Recorder::default());
        let high = Arc::new(Recorder::default());
        broker.start_consumer("low", options(0), low.clone()).await.expect("start");
        broker.start_consumer("high", options(10), high.clone()).await.expect("start");

        assert_eq!(broker.publish("a"), Some(1));
        assert_eq!(broker.publish("b"), Some(2));
        assert_eq!(*high.received.lock(), vec![1, 2]);
        assert!(low.received.lock().is_empty());
    }

    #[test]
    fn test_publish_without_consumer_goes_to_backlog() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("a"), None);
        assert_eq!(broker.backlog(), vec![b"a".to_vec()]);
        assert_eq!(broker.consume_backlog(5), 1);
        assert!(broker.backlog().is_empty());
    }

    #[tokio::test]
    async fn test_settlement_is_strict() {
        let broker = MemoryBroker::new();
        let consumer = Arc::new(Recorder::default());
        broker.start_consumer("c", options(1), consumer).await.expect("start");
        broker.publish_all(["1", "2", "3", "4"]);

        broker.ack(3).expect("ack");
        broker.nack(2, true).expect("nack multiple");
        assert_eq!(broker.nacked(), vec![1, 2]);
        assert_eq!(broker.unsettled(), vec![4]);

        assert!(broker.ack(3).is_err());
        assert!(broker.nack(1, false).is_err());
        assert!(broker.nack(9, false).is_err());
        assert_eq!(broker.violations().len(), 3);

        broker.nack(4, false).expect("nack single");
        assert!(broker.unsettled().is_empty());
        assert_eq!(broker.backlog().len(), 3);
    }

    #[tokio::test]
    async fn test_held_cancellation() {
        let broker = MemoryBroker::new();
        let consumer = Arc::new(Recorder::default());
        broker.start_consumer("c", options(1), consumer.clone()).await.expect("start");

        broker.hold_cancellations();
        broker.cancel("c").expect("cancel");
        assert_eq!(*consumer.cancelled.lock(), 0);
        assert_eq!(broker.consumer_count(), 0);

        broker.release_cancellations();
        broker.cancellations(1).await;
        assert_eq!(*consumer.cancelled.lock(), 1);
        assert_eq!(
            broker.operations().last(),
            Some(&BrokerOperation::CancelConfirmed("c".into()))
        );
    }

    #[tokio::test]
    async fn test_dispose_closes_channel() {
        let broker = MemoryBroker::new();
        let consumer = Arc::new(Recorder::default());
        broker.start_consumer("c", options(1), consumer.clone()).await.expect("start");
        broker.fail_connection("reset");
        assert_eq!(consumer.failed.lock().len(), 1);

        broker.dispose();
        broker.dispose();
        assert!(broker.is_disposed());
        assert_eq!(broker.ack(1), Err(BrokerError::Closed));
        assert!(broker
            .start_consumer("d", options(1), consumer)
            .await
            .is_err());
        let disposals = broker
            .operations()
            .into_iter()
            .filter(|op| *op == BrokerOperation::Dispose)
            .count();
        assert_eq!(disposals, 1);
    }
}
