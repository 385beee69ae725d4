// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Processing coordinator.
//!
//! Owns the waiters, the settlement ledger and the current consumer
//! generation. A generation is started when a waiter is registered and none
//! is running, and stops itself once no waiter is left, handing buffered
//! messages back to the backup consumers.
//!
//! # Locking
//!
//! Waiters, ledger and generation pointer live behind one mutex. Broker calls
//! happen outside of it, except the reject of a failure that arrives after
//! its generation was torn down. The lock is never held across an `.await`.

use crate::broker::{consumer_tag, BrokerClient, BrokerError, ConsumerEvents, ConsumerOptions};
use crate::config::HarnessSettings;
use crate::error::{HarnessError, HarnessResult};
use crate::generation::{ConsumerGeneration, GenerationState};
use crate::ledger::{AckLedger, Settlement};
use crate::pending::{PendingMessage, Registration};
use crate::report::{human_readable, TimeoutReason};
use crate::waiter::{first_match, MatchOutcome, Waiter};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

/// Message types the harness can wait for.
pub trait Message: DeserializeOwned + Clone + Send + 'static {}

impl<T> Message for T where T: DeserializeOwned + Clone + Send + 'static {}

/// Processing callback run for every matched message.
pub type ProcessFn<M> = Arc<dyn Fn(M) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Stealing priority consumer that hands matched messages to a callback.
///
/// Registration starts a consumer generation if none is running; the
/// returned [`PendingMessage`] resolves once the callback has run and the
/// delivery was acknowledged.
pub struct ProcessingCoordinator<M: Message> {
    shared: Arc<Shared<M>>,
}

pub(crate) struct Shared<M: Message> {
    broker: Arc<dyn BrokerClient>,
    process: ProcessFn<M>,
    settings: HarnessSettings,
    context: String,
    permits: Arc<Semaphore>,
    next_waiter_id: AtomicU64,
    state: Mutex<State<M>>,
}

struct State<M> {
    waiters: Vec<Waiter<M>>,
    ledger: AckLedger,
    generation: Option<Arc<ConsumerGeneration>>,
    failure: Option<HarnessError>,
}

struct Delivery {
    delivery_tag: u64,
    body: Vec<u8>,
}

impl<M: Message> ProcessingCoordinator<M> {
    /// Create a coordinator. No broker call is made until the first wait.
    pub fn new<F, Fut>(
        context: impl Into<String>,
        broker: Arc<dyn BrokerClient>,
        settings: HarnessSettings,
        process: F,
    ) -> Self
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let process: ProcessFn<M> =
            Arc::new(move |message: M| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(process(message))
            });
        let permits = Arc::new(Semaphore::new(usize::from(settings.prefetch_count.max(1))));
        Self {
            shared: Arc::new(Shared {
                broker,
                process,
                settings,
                context: context.into(),
                permits,
                next_waiter_id: AtomicU64::new(1),
                state: Mutex::new(State {
                    waiters: Vec::new(),
                    ledger: AckLedger::new(),
                    generation: None,
                    failure: None,
                }),
            }),
        }
    }

    /// Wait for a message matching `predicate`.
    ///
    /// Returns once a consumer is observing the queue, so messages published
    /// afterwards are seen. The deadline starts when the result is awaited.
    pub async fn wait_for<P>(
        &self,
        description: impl Into<String>,
        predicate: P,
    ) -> HarnessResult<PendingMessage<M>>
    where
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.try_wait_for(description, move |message: &M| -> anyhow::Result<bool> {
            Ok(predicate(message))
        })
        .await
    }

    /// Like [`wait_for`](Self::wait_for) with a predicate that can fail.
    ///
    /// A failing predicate counts as a non-match; its errors are reported if
    /// nothing matches before the deadline.
    pub async fn try_wait_for<P>(
        &self,
        description: impl Into<String>,
        predicate: P,
    ) -> HarnessResult<PendingMessage<M>>
    where
        P: Fn(&M) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let description: String = description.into();
        let waiter_id = self.shared.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, completion) = Waiter::new(waiter_id, description, Box::new(predicate));

        let generation = Shared::register(&self.shared, waiter)?;
        let registration = Registration::new(Arc::clone(&self.shared), waiter_id);
        generation.started().await?;

        Ok(PendingMessage::new(registration, completion))
    }

    /// Stop the consumer, cancel every waiter and release the broker.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.shared.settings
    }

    pub fn context(&self) -> &str {
        &self.shared.context
    }

    /// Number of registered waiters that have not matched yet.
    pub fn pending_waiters(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// State of the current consumer generation, if any.
    pub fn generation_state(&self) -> Option<GenerationState> {
        self.shared
            .state
            .lock()
            .generation
            .as_ref()
            .map(|generation| generation.state())
    }
}

impl<M: Message> Drop for ProcessingCoordinator<M> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl<M: Message> Shared<M> {
    pub(crate) fn timeout(&self) -> Duration {
        self.settings.timeout()
    }

    /// Add a waiter and return the generation that will observe it.
    fn register(
        self: &Arc<Self>,
        waiter: Waiter<M>,
    ) -> HarnessResult<Arc<ConsumerGeneration>> {
        let (generation, previous) = {
            let mut state = self.state.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            state.waiters.push(waiter);

            let previous = match state.generation.clone() {
                Some(current)
                    if !matches!(
                        current.state(),
                        GenerationState::Stopped | GenerationState::Complete
                    ) =>
                {
                    return Ok(current);
                }
                // Stopped, or complete with its rejects possibly still in flight.
                current => current,
            };

            let generation = Arc::new(ConsumerGeneration::new(consumer_tag()));
            state.generation = Some(Arc::clone(&generation));
            (generation, previous)
        };

        tokio::spawn(Arc::clone(self).run_generation(Arc::clone(&generation), previous));
        Ok(generation)
    }

    /// Remove an abandoned waiter.
    pub(crate) fn deregister(&self, waiter_id: u64) {
        let mut state = self.state.lock();
        if let Some(index) = state.waiters.iter().position(|w| w.id() == waiter_id) {
            state.waiters.remove(index);
            stop_if_idle(&state);
        }
    }

    /// Time out a waiter that is still unmatched; `None` when it was claimed.
    pub(crate) fn expire(&self, waiter_id: u64) -> Option<HarnessError> {
        let mut state = self.state.lock();
        let index = state.waiters.iter().position(|w| w.id() == waiter_id)?;
        let waiter = state.waiters.remove(index);
        stop_if_idle(&state);

        let mut report = waiter.report(TimeoutReason::AfterAwait, self.timeout(), &self.context);
        // The broker stops delivering once the prefetch window is full.
        let last_observed = state.ledger.last_observed();
        if last_observed >= u64::from(self.settings.prefetch_count) {
            report.prefetch = Some((self.settings.prefetch_count, last_observed));
        }
        Some(waiter.timeout_error(report))
    }

    async fn run_generation(
        self: Arc<Self>,
        generation: Arc<ConsumerGeneration>,
        previous: Option<Arc<ConsumerGeneration>>,
    ) {
        match self.start_generation(&generation, previous).await {
            Ok(Some(inbound)) => self.route(&generation, inbound).await,
            Ok(None) => {}
            Err(error) => {
                tracing::error!(
                    "consumer {} failed to start: {}",
                    generation.consumer_tag(),
                    error
                );
                generation.set_exception(error.clone());
                self.fail(error);
            }
        }
    }

    async fn start_generation(
        self: &Arc<Self>,
        generation: &Arc<ConsumerGeneration>,
        previous: Option<Arc<ConsumerGeneration>>,
    ) -> HarnessResult<Option<mpsc::UnboundedReceiver<Delivery>>> {
        let timeout = self.timeout();

        if let Some(previous) = previous {
            tracing::debug!(
                "waiting for consumer {} to complete",
                previous.consumer_tag()
            );
            match tokio::time::timeout(timeout, previous.fully_stopped()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(HarnessError::Generation(format!(
                        "timeout waiting for previous consumer to complete after {}",
                        human_readable(timeout)
                    )))
                }
            }
        }

        if generation.stop_token().is_cancelled() {
            // Abandoned before subscribing. Failures recorded while it was
            // current still need its ledger pass.
            self.teardown(generation);
            return Ok(None);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let events = Arc::new(GenerationEvents {
            shared: Arc::downgrade(self),
            generation: Arc::clone(generation),
            inbound: inbound_tx,
        });
        let options = ConsumerOptions {
            priority: self.settings.priority,
            prefetch_count: self.settings.prefetch_count,
        };

        let start = self
            .broker
            .start_consumer(generation.consumer_tag(), options, events);
        match tokio::time::timeout(timeout, start).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(HarnessError::Transport(err)),
            Err(_) => {
                return Err(HarnessError::Generation(format!(
                    "timeout waiting for consumer to start after {}",
                    human_readable(timeout)
                )))
            }
        }

        tracing::info!(
            "consumer {} started (priority {}, prefetch {})",
            generation.consumer_tag(),
            options.priority,
            options.prefetch_count
        );
        generation.set_started();
        Ok(Some(inbound_rx))
    }

    /// Route deliveries to waiters until the generation stops.
    async fn route(
        self: &Arc<Self>,
        generation: &Arc<ConsumerGeneration>,
        mut inbound: mpsc::UnboundedReceiver<Delivery>,
    ) {
        let stop = generation.stop_token().clone();
        let timeout = self.timeout();
        let mut unmatched_deadline: Option<Instant> = None;
        let mut expired = false;

        loop {
            let delivery = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = sleep_until(unmatched_deadline) => {
                    expired = true;
                    break;
                }
                delivery = inbound.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if self.dispatch(generation, delivery) {
                unmatched_deadline = None;
            } else if unmatched_deadline.is_none() {
                unmatched_deadline = Some(Instant::now() + timeout);
            }
        }

        if expired {
            self.expire_all(generation);
        }

        tracing::info!("consumer {} stopping", generation.consumer_tag());
        if let Err(err) = self.broker.cancel(generation.consumer_tag()) {
            self.fail(HarnessError::Transport(err));
        }
    }

    /// Offer one delivery to the waiters; true when it was claimed.
    fn dispatch(self: &Arc<Self>, generation: &ConsumerGeneration, delivery: Delivery) -> bool {
        let Delivery { delivery_tag, body } = delivery;
        let decoded = match serde_json::from_slice::<M>(&body) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::debug!("delivery {} is malformed: {}", delivery_tag, err);
                None
            }
        };

        let claimed = {
            let mut state = self.state.lock();
            if generation.stop_token().is_cancelled() {
                return false;
            }
            let claimed = match first_match(&mut state.waiters, decoded.as_ref(), &body) {
                MatchOutcome::Matched(index) => {
                    state.ledger.start_processing(delivery_tag);
                    Some(state.waiters.remove(index))
                }
                MatchOutcome::Malformed | MatchOutcome::NoMatch => None,
            };
            if state.waiters.is_empty() {
                generation.stop();
            }
            claimed
        };

        match (claimed, decoded) {
            (Some(waiter), Some(message)) => {
                tracing::debug!(
                    "delivery {} claimed by `{}`",
                    delivery_tag,
                    waiter.description()
                );
                tokio::spawn(Arc::clone(self).complete(waiter, delivery_tag, message));
                true
            }
            _ => false,
        }
    }

    /// Fail every waiter after an unmatched delivery sat past the deadline.
    fn expire_all(&self, generation: &ConsumerGeneration) {
        let waiters = {
            let mut state = self.state.lock();
            if generation.stop_token().is_cancelled() {
                return;
            }
            generation.stop();
            std::mem::take(&mut state.waiters)
        };

        tracing::warn!(
            "consumer {}: unmatched message not settled within {}, failing {} waiter(s)",
            generation.consumer_tag(),
            human_readable(self.timeout()),
            waiters.len()
        );
        for mut waiter in waiters {
            let report =
                waiter.report(TimeoutReason::UnackedMessage, self.timeout(), &self.context);
            let error = waiter.timeout_error(report);
            waiter.fail(error);
        }
    }

    /// Run the callback for a claimed delivery and settle it.
    async fn complete(self: Arc<Self>, mut waiter: Waiter<M>, delivery_tag: u64, message: M) {
        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok();

        let outcome = match tokio::spawn((self.process)(message.clone())).await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!(
                "processing callback panicked: {}",
                join_error
            )),
        };

        match outcome {
            Ok(()) => match self.broker.ack(delivery_tag) {
                Ok(()) => {
                    self.settle(delivery_tag, Settlement::Acked);
                    waiter.resolve(message);
                }
                Err(err) => {
                    let error = HarnessError::Transport(err);
                    waiter.fail(error.clone());
                    self.fail(error);
                }
            },
            Err(err) => {
                tracing::warn!("processing delivery {} failed: {:#}", delivery_tag, err);
                self.reject_failed(delivery_tag);
                waiter.fail(HarnessError::processing(delivery_tag, err));
            }
        }
    }

    fn settle(&self, delivery_tag: u64, settlement: Settlement) {
        if let Err(err) = self.state.lock().ledger.end_processing(delivery_tag, settlement) {
            tracing::warn!("ledger: {}", err);
        }
    }

    /// Record a failed delivery; reject it now if its teardown already ran.
    fn reject_failed(&self, delivery_tag: u64) {
        let mut state = self.state.lock();
        let torn_down = state
            .generation
            .as_ref()
            .map_or(true, |generation| generation.state().is_terminal());

        let settlement = if torn_down {
            Settlement::AlreadyNacked
        } else {
            Settlement::ShouldNack
        };
        if let Err(err) = state.ledger.end_processing(delivery_tag, settlement) {
            tracing::warn!("ledger: {}", err);
        }
        if !torn_down {
            return;
        }

        let result = self.broker.nack(delivery_tag, false);
        drop(state);
        if let Err(err) = result {
            self.fail(HarnessError::Transport(err));
        }
    }

    /// The broker confirmed the cancel of `generation`, or it never subscribed.
    ///
    /// The next generation may subscribe once the rejects are issued.
    fn teardown(&self, generation: &ConsumerGeneration) {
        let plan = {
            let mut state = self.state.lock();
            if let Err(error) = generation.set_complete() {
                drop(state);
                self.fail(error);
                return;
            }
            state.ledger.teardown()
        };

        tracing::debug!(
            "consumer {} torn down: nack multiple {:?}, single {:?}",
            generation.consumer_tag(),
            plan.batch(),
            plan.single
        );
        let issued = plan
            .batch()
            .map_or(Ok(()), |tag| self.broker.nack(tag, true))
            .and_then(|()| {
                plan.single
                    .iter()
                    .try_for_each(|&tag| self.broker.nack(tag, false))
            });
        match issued {
            Ok(()) => generation.signal_stopped(),
            Err(err) => {
                let error = HarnessError::Transport(err);
                generation.set_exception(error.clone());
                self.fail(error);
            }
        }
    }

    /// Terminal failure: fail every waiter and release the broker.
    fn fail(&self, error: HarnessError) {
        let waiters = {
            let mut state = self.state.lock();
            if state.failure.is_some() {
                return;
            }
            tracing::error!("message harness {} failed: {}", self.context, error);
            state.failure = Some(error.clone());
            if let Some(generation) = state.generation.take() {
                generation.set_exception(error.clone());
            }
            std::mem::take(&mut state.waiters)
        };

        for mut waiter in waiters {
            waiter.fail(error.clone());
        }
        self.broker.dispose();
    }

    fn dispose(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if matches!(state.failure, Some(HarnessError::Disposed)) {
                return;
            }
            if let Some(generation) = &state.generation {
                generation.stop();
            }
            state.failure = Some(HarnessError::Disposed);
            std::mem::take(&mut state.waiters)
        };

        tracing::debug!(
            "message harness {} disposed, cancelling {} waiter(s)",
            self.context,
            waiters.len()
        );
        for mut waiter in waiters {
            waiter.cancel();
        }
        self.broker.dispose();
    }
}

/// Stop the current generation when no waiter is left.
fn stop_if_idle<M>(state: &State<M>) {
    if state.waiters.is_empty() {
        if let Some(generation) = &state.generation {
            generation.stop();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Broker callbacks of one generation.
struct GenerationEvents<M: Message> {
    shared: Weak<Shared<M>>,
    generation: Arc<ConsumerGeneration>,
    inbound: mpsc::UnboundedSender<Delivery>,
}

impl<M: Message> ConsumerEvents for GenerationEvents<M> {
    fn on_received(&self, delivery_tag: u64, body: Vec<u8>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().ledger.observe(delivery_tag);
        }
        // After the routing loop exited the teardown settles the tag.
        let _ignore_closed = self.inbound.send(Delivery { delivery_tag, body });
    }

    fn on_cancelled(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.teardown(&self.generation);
        }
    }

    fn on_failed(&self, error: BrokerError) {
        tracing::error!(
            "consumer {} channel failure: {}",
            self.generation.consumer_tag(),
            error
        );
        if let Some(shared) = self.shared.upgrade() {
            shared.fail(HarnessError::Transport(error));
        }
    }
}
