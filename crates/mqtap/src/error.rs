// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Harness error types.

use crate::broker::BrokerError;
use crate::report::TimeoutReport;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used across the harness.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors surfaced to callers of the harness.
///
/// Cloneable so a single terminal failure can be handed to every pending waiter.
#[derive(Debug, Clone, Error)]
pub enum HarnessError {
    /// No matching message arrived before the deadline.
    #[error("timed out waiting for message\n{0}")]
    Timeout(Box<TimeoutReport>),

    /// No match before the deadline and the predicate raised at least once.
    #[error("predicate failed while waiting for message\n{0}")]
    Predicate(Box<TimeoutReport>),

    /// The processing callback failed for a matched message.
    #[error("processing delivery {delivery_tag} failed: {error}")]
    Processing {
        delivery_tag: u64,
        error: Arc<anyhow::Error>,
    },

    /// The broker reported a failure; terminal for the coordinator.
    #[error("transport failure: {0}")]
    Transport(#[from] BrokerError),

    /// The coordinator has been disposed.
    #[error("message harness has been disposed")]
    Disposed,

    /// The wait was cancelled before it completed.
    #[error("wait for message was cancelled")]
    Cancelled,

    /// A consumer generation could not start, stop or complete.
    #[error("consumer generation failure: {0}")]
    Generation(String),

    /// The queue still had messages when the deadline passed.
    #[error("queue `{queue}` not drained after {timeout}")]
    QueueNotDrained { queue: String, timeout: String },
}

impl HarnessError {
    pub(crate) fn processing(delivery_tag: u64, error: anyhow::Error) -> Self {
        Self::Processing {
            delivery_tag,
            error: Arc::new(error),
        }
    }

    /// Timeout diagnostics, for `Timeout` and `Predicate` failures.
    pub fn report(&self) -> Option<&TimeoutReport> {
        match self {
            Self::Timeout(report) | Self::Predicate(report) => Some(report),
            _ => None,
        }
    }

    /// Whether the coordinator that produced this error is unusable afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Disposed | Self::Generation(_)
        )
    }
}
