// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Predicate waiters.

use crate::error::HarnessError;
use crate::report::{TimeoutReason, TimeoutReport, SAMPLE_CAP};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Caller predicate; an error counts as a non-match and is kept for diagnostics.
pub type Predicate<M> = Box<dyn Fn(&M) -> anyhow::Result<bool> + Send + Sync>;

/// Receiving half of a waiter's completion.
pub type Completion<M> = oneshot::Receiver<Result<M, HarnessError>>;

/// Result of offering one delivery to the pending waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The waiter at this index claimed the delivery.
    Matched(usize),
    /// The body could not be decoded.
    Malformed,
    NoMatch,
}

/// One pending predicate and its diagnostic samples.
pub struct Waiter<M> {
    id: u64,
    description: Arc<str>,
    predicate: Predicate<M>,
    message_count: usize,
    observed: Vec<String>,
    malformed: Vec<String>,
    predicate_failures: Vec<String>,
    completion: Option<oneshot::Sender<Result<M, HarnessError>>>,
}

impl<M> Waiter<M> {
    pub fn new(
        id: u64,
        description: impl Into<Arc<str>>,
        predicate: Predicate<M>,
    ) -> (Self, Completion<M>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Self {
            id,
            description: description.into(),
            predicate,
            message_count: 0,
            observed: Vec::new(),
            malformed: Vec::new(),
            predicate_failures: Vec::new(),
            completion: Some(tx),
        };
        (waiter, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Evaluate the predicate against a decoded delivery.
    pub fn try_match(&mut self, message: &M, raw: &[u8]) -> bool {
        self.message_count += 1;
        if self.observed.len() < SAMPLE_CAP {
            self.observed.push(String::from_utf8_lossy(raw).into_owned());
        }

        let predicate = &self.predicate;
        match catch_unwind(AssertUnwindSafe(|| predicate(message))) {
            Ok(Ok(matched)) => matched,
            Ok(Err(err)) => {
                self.record_predicate_failure(format!("{:#}", err));
                false
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.record_predicate_failure(format!("predicate panicked: {}", reason));
                false
            }
        }
    }

    /// Record a body that could not be decoded.
    pub fn record_malformed(&mut self, raw: &[u8]) {
        self.message_count += 1;
        if self.malformed.len() < SAMPLE_CAP {
            self.malformed.push(String::from_utf8_lossy(raw).into_owned());
        }
    }

    fn record_predicate_failure(&mut self, failure: String) {
        tracing::debug!("waiter {}: {}", self.description, failure);
        if self.predicate_failures.len() < SAMPLE_CAP {
            self.predicate_failures.push(failure);
        }
    }

    pub fn resolve(&mut self, message: M) {
        self.complete(Ok(message));
    }

    pub fn fail(&mut self, error: HarnessError) {
        self.complete(Err(error));
    }

    pub fn cancel(&mut self) {
        self.complete(Err(HarnessError::Cancelled));
    }

    fn complete(&mut self, result: Result<M, HarnessError>) {
        if let Some(tx) = self.completion.take() {
            // The caller may have stopped waiting.
            let _ignore_closed = tx.send(result);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }

    /// Diagnostics for a waiter that never matched.
    pub fn report(&self, reason: TimeoutReason, timeout: Duration, context: &str) -> TimeoutReport {
        TimeoutReport {
            description: self.description.to_string(),
            context: context.to_string(),
            reason,
            timeout,
            message_count: self.message_count,
            observed: self.observed.clone(),
            malformed: self.malformed.clone(),
            predicate_failures: self.predicate_failures.clone(),
            prefetch: None,
        }
    }

    /// Error for a waiter that never matched; predicate failures take precedence.
    pub fn timeout_error(&self, report: TimeoutReport) -> HarnessError {
        if self.predicate_failures.is_empty() {
            HarnessError::Timeout(Box::new(report))
        } else {
            HarnessError::Predicate(Box::new(report))
        }
    }
}

/// Offer a delivery to every waiter in registration order; the first match wins.
///
/// Waiters after the winner never see the delivery.
pub fn first_match<M>(waiters: &mut [Waiter<M>], decoded: Option<&M>, raw: &[u8]) -> MatchOutcome {
    let Some(message) = decoded else {
        for waiter in waiters.iter_mut() {
            waiter.record_malformed(raw);
        }
        return MatchOutcome::Malformed;
    };

    waiters
        .iter_mut()
        .position(|waiter| waiter.try_match(message, raw))
        .map_or(MatchOutcome::NoMatch, MatchOutcome::Matched)
}
