// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wait for a queue to become empty.
//!
//! A single background poller serves every waiter: it sleeps until someone
//! registers, then polls the queue depth until it reaches zero or the
//! timeout elapses. Large queues are polled less often.

use crate::broker::BrokerError;
use crate::error::{HarnessError, HarnessResult};
use crate::report::human_readable;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Depth below which the queue is polled quickly.
const SMALL_QUEUE: u64 = 100;
const FAST_POLL: Duration = Duration::from_millis(100);
const SLOW_POLL: Duration = Duration::from_secs(1);

/// Future returned by [`QueueDepth::message_count`].
pub type DepthFuture<'a> = Pin<Box<dyn Future<Output = Result<u64, BrokerError>> + Send + 'a>>;

/// Source of the number of ready messages in a queue.
pub trait QueueDepth: Send + Sync {
    fn message_count(&self) -> DepthFuture<'_>;
}

type DrainSender = oneshot::Sender<HarnessResult<()>>;

#[derive(Default)]
struct DrainState {
    waiters: Vec<DrainSender>,
    failure: Option<HarnessError>,
}

/// Resolves registrations once the queue is empty.
pub struct DrainWaiter {
    queue: String,
    state: Arc<Mutex<DrainState>>,
    wake: Arc<Notify>,
    poller: JoinHandle<()>,
}

impl DrainWaiter {
    /// Spawn the poller. Must be called within a Tokio runtime.
    pub fn new(queue: impl Into<String>, source: Arc<dyn QueueDepth>, timeout: Duration) -> Self {
        let queue = queue.into();
        let state = Arc::new(Mutex::new(DrainState::default()));
        let wake = Arc::new(Notify::new());
        let poller = tokio::spawn(poll_loop(
            queue.clone(),
            source,
            timeout,
            Arc::clone(&state),
            Arc::clone(&wake),
        ));
        Self {
            queue,
            state,
            wake,
            poller,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait until the queue is empty.
    ///
    /// The poll starts at registration; the returned future only observes it.
    pub fn wait_for_empty_queue(
        &self,
    ) -> HarnessResult<impl Future<Output = HarnessResult<()>> + Send + 'static> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            state.waiters.push(tx);
        }
        self.wake.notify_one();
        Ok(async move { rx.await.unwrap_or(Err(HarnessError::Cancelled)) })
    }
}

impl Drop for DrainWaiter {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn poll_loop(
    queue: String,
    source: Arc<dyn QueueDepth>,
    timeout: Duration,
    state: Arc<Mutex<DrainState>>,
    wake: Arc<Notify>,
) {
    loop {
        wake.notified().await;
        if state.lock().waiters.is_empty() {
            continue;
        }

        let deadline = Instant::now() + timeout;
        let outcome = loop {
            let count = match tokio::time::timeout_at(deadline, source.message_count()).await {
                Ok(Ok(count)) => count,
                Ok(Err(err)) => break Err(HarnessError::Transport(err)),
                Err(_) => break Err(not_drained(&queue, timeout)),
            };
            tracing::debug!("drain: queue {} has {} messages", queue, count);
            if count == 0 {
                break Ok(());
            }

            let pause = if count < SMALL_QUEUE {
                FAST_POLL
            } else {
                SLOW_POLL
            };
            if Instant::now() + pause >= deadline {
                tokio::time::sleep_until(deadline).await;
                break Err(not_drained(&queue, timeout));
            }
            tokio::time::sleep(pause).await;
        };

        let terminal = matches!(outcome, Err(HarnessError::Transport(_)));
        let waiters = {
            let mut state = state.lock();
            if terminal {
                if let Err(err) = &outcome {
                    state.failure = Some(err.clone());
                }
            }
            std::mem::take(&mut state.waiters)
        };
        if let Err(err) = &outcome {
            tracing::warn!("drain: {}", err);
        }
        for waiter in waiters {
            let _ignore_closed = waiter.send(outcome.clone());
        }
        if terminal {
            return;
        }
    }
}

fn not_drained(queue: &str, timeout: Duration) -> HarnessError {
    HarnessError::QueueNotDrained {
        queue: queue.to_string(),
        timeout: human_readable(timeout),
    }
}

/// Queue depth read from the broker management HTTP API.
#[cfg(feature = "management-api")]
pub struct ManagementQueueDepth {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

#[cfg(feature = "management-api")]
impl ManagementQueueDepth {
    /// Queue `queue` of the default virtual host on `server:15672`, guest credentials.
    pub fn new(server: &str, queue: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{}:15672/api/queues/%2f/{}", server, queue),
            user: "guest".to_string(),
            password: "guest".to_string(),
        }
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }
}

#[cfg(feature = "management-api")]
#[derive(serde::Deserialize)]
struct QueueInfo {
    #[serde(default)]
    messages: u64,
}

#[cfg(feature = "management-api")]
impl QueueDepth for ManagementQueueDepth {
    fn message_count(&self) -> DepthFuture<'_> {
        Box::pin(async move {
            let connection = |err: reqwest::Error| BrokerError::Connection(err.to_string());
            let info: QueueInfo = self
                .client
                .get(&self.url)
                .basic_auth(&self.user, Some(&self.password))
                .send()
                .await
                .map_err(connection)?
                .error_for_status()
                .map_err(connection)?
                .json()
                .await
                .map_err(|err| BrokerError::Protocol(err.to_string()))?;
            Ok(info.messages)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a scripted sequence of depths; the last one repeats.
    struct Script(Mutex<VecDeque<Result<u64, BrokerError>>>);

    impl Script {
        fn new(depths: Vec<Result<u64, BrokerError>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(depths.into())))
        }
    }

    impl QueueDepth for Script {
        fn message_count(&self) -> DepthFuture<'_> {
            let mut depths = self.0.lock();
            let next = if depths.len() > 1 {
                depths.pop_front()
            } else {
                depths.front().cloned()
            };
            Box::pin(std::future::ready(next.unwrap_or(Ok(0))))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_when_empty() {
        let drain = DrainWaiter::new(
            "orders",
            Script::new(vec![Ok(3), Ok(1), Ok(0)]),
            Duration::from_secs(5),
        );
        let first = drain.wait_for_empty_queue().expect("register");
        let second = drain.wait_for_empty_queue().expect("register");
        first.await.expect("drained");
        second.await.expect("drained");
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_not_drained() {
        let drain = DrainWaiter::new("orders", Script::new(vec![Ok(500)]), Duration::from_secs(3));
        let err = drain
            .wait_for_empty_queue()
            .expect("register")
            .await
            .unwrap_err();
        match err {
            HarnessError::QueueNotDrained { queue, timeout } => {
                assert_eq!(queue, "orders");
                assert_eq!(timeout, "3000 milliseconds");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Not terminal: a later registration polls again.
        assert!(drain.wait_for_empty_queue().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_is_terminal() {
        let drain = DrainWaiter::new(
            "orders",
            Script::new(vec![Err(BrokerError::Connection("refused".into()))]),
            Duration::from_secs(1),
        );
        let err = drain
            .wait_for_empty_queue()
            .expect("register")
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Transport(_)));
        assert!(matches!(
            drain.wait_for_empty_queue(),
            Err(HarnessError::Transport(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_broker_backlog() {
        let broker = Arc::new(crate::memory::MemoryBroker::new());
        broker.publish("a");
        broker.publish("b");

        let drain = DrainWaiter::new("orders", broker.clone(), Duration::from_secs(5));
        let drained = drain.wait_for_empty_queue().expect("register");
        broker.consume_backlog(2);
        drained.await.expect("drained");
    }
}
