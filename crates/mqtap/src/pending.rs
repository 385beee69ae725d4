// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deferred wait results.

use crate::coordinator::{Message, Shared};
use crate::error::{HarnessError, HarnessResult};
use crate::waiter::Completion;
use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::Arc;

/// Keeps a waiter registered until the wait finishes or is abandoned.
pub(crate) struct Registration<M: Message> {
    shared: Arc<Shared<M>>,
    waiter_id: u64,
    armed: bool,
}

impl<M: Message> Registration<M> {
    pub(crate) fn new(shared: Arc<Shared<M>>, waiter_id: u64) -> Self {
        Self {
            shared,
            waiter_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<M: Message> Drop for Registration<M> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.deregister(self.waiter_id);
        }
    }
}

/// A registered wait whose deadline starts when it is awaited.
///
/// ```ignore
/// let pending = harness.wait_for("order 7", |order: &Order| order.id == 7).await?;
/// publish_order(7).await?;
/// let order = pending.await?;
/// ```
///
/// Dropping it without awaiting removes the waiter.
#[must_use = "the waiter is removed when the pending message is dropped"]
pub struct PendingMessage<M: Message> {
    registration: Registration<M>,
    completion: Completion<M>,
}

impl<M: Message> PendingMessage<M> {
    pub(crate) fn new(registration: Registration<M>, completion: Completion<M>) -> Self {
        Self {
            registration,
            completion,
        }
    }

    async fn wait(mut self) -> HarnessResult<M> {
        let timeout = self.registration.shared.timeout();
        let received = match tokio::time::timeout(timeout, &mut self.completion).await {
            Ok(received) => received,
            Err(_elapsed) => match self.registration.shared.expire(self.registration.waiter_id) {
                Some(error) => {
                    self.registration.disarm();
                    return Err(error);
                }
                // Already claimed; the callback outcome decides.
                None => (&mut self.completion).await,
            },
        };
        self.registration.disarm();
        received.unwrap_or(Err(HarnessError::Cancelled))
    }
}

impl<M: Message> IntoFuture for PendingMessage<M> {
    type Output = HarnessResult<M>;
    type IntoFuture = BoxFuture<'static, HarnessResult<M>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
