// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer generation lifecycle.
//!
//! A generation is one stolen subscription to the queue, from the consume
//! request to the broker's cancel confirmation:
//!
//! ```text
//! Initial --start--> Started --stop--> Stopped --complete--> Complete
//!    |                  |                 |
//!    +------stop--------+-----------------+
//!
//! any non-terminal state --fail--> Errored
//! ```
//!
//! `Complete` and `Errored` are terminal. Completing a generation that was
//! never stopped means the broker confirmed a cancel nobody asked for; that
//! is a contract violation and moves the generation to `Errored`.

use crate::error::{HarnessError, HarnessResult};
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a consumer generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Initial,
    Started,
    Stopped,
    Complete,
    Errored,
}

impl GenerationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored)
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEvent {
    Start,
    Stop,
    Complete,
    Fail,
}

/// Outcome of applying an event to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Move(GenerationState),
    Ignore,
    Violation,
}

/// Transition function of the generation state machine.
pub fn transition(from: GenerationState, event: GenerationEvent) -> Step {
    use GenerationEvent as E;
    use GenerationState as S;

    match (from, event) {
        (S::Initial, E::Start) => Step::Move(S::Started),
        (S::Initial | S::Started, E::Stop) => Step::Move(S::Stopped),
        (S::Stopped, E::Complete) => Step::Move(S::Complete),
        (S::Initial | S::Started, E::Complete) => Step::Violation,
        (S::Errored, E::Fail) => Step::Ignore,
        (_, E::Fail) => Step::Move(S::Errored),
        _ => Step::Ignore,
    }
}

/// Resolution of a one-shot lifecycle signal.
#[derive(Debug, Clone)]
enum Signal {
    Pending,
    Ready,
    Cancelled,
    Failed(HarnessError),
}

/// One stolen subscription and its lifecycle signals.
pub struct ConsumerGeneration {
    consumer_tag: String,
    state: Mutex<GenerationState>,
    stop: CancellationToken,
    started: watch::Sender<Signal>,
    stopped: watch::Sender<Signal>,
}

impl ConsumerGeneration {
    pub fn new(consumer_tag: impl Into<String>) -> Self {
        let (started, _) = watch::channel(Signal::Pending);
        let (stopped, _) = watch::channel(Signal::Pending);
        Self {
            consumer_tag: consumer_tag.into(),
            state: Mutex::new(GenerationState::Initial),
            stop: CancellationToken::new(),
            started,
            stopped,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> GenerationState {
        *self.state.lock()
    }

    /// Token cancelled once the generation stops or fails.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// The broker confirmed the subscription.
    pub fn set_started(&self) {
        let mut state = self.state.lock();
        if let Step::Move(next) = transition(*state, GenerationEvent::Start) {
            *state = next;
            resolve(&self.started, Signal::Ready);
        }
    }

    /// Stop routing; the subscription will be cancelled.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Step::Move(next) = transition(*state, GenerationEvent::Stop) {
            if *state == GenerationState::Initial {
                resolve(&self.started, Signal::Cancelled);
            }
            *state = next;
            self.stop.cancel();
        }
    }

    /// The broker confirmed the cancel; teardown may run.
    ///
    /// `fully_stopped` stays pending until [`signal_stopped`](Self::signal_stopped).
    pub fn set_complete(&self) -> HarnessResult<()> {
        let mut state = self.state.lock();
        match transition(*state, GenerationEvent::Complete) {
            Step::Move(next) => {
                *state = next;
                Ok(())
            }
            Step::Ignore => Ok(()),
            Step::Violation => {
                let error = HarnessError::Generation(format!(
                    "consumer {} cancelled by the broker while {}",
                    self.consumer_tag, *state
                ));
                self.fail_locked(&mut state, error.clone());
                Err(error)
            }
        }
    }

    /// Teardown finished; a following generation may subscribe.
    pub fn signal_stopped(&self) {
        let state = self.state.lock();
        if *state == GenerationState::Complete {
            resolve(&self.stopped, Signal::Ready);
        }
    }

    /// Move to `Errored`, failing every unresolved signal.
    pub fn set_exception(&self, error: HarnessError) {
        let mut state = self.state.lock();
        self.fail_locked(&mut state, error);
    }

    fn fail_locked(&self, state: &mut GenerationState, error: HarnessError) {
        if let Step::Move(next) = transition(*state, GenerationEvent::Fail) {
            *state = next;
            resolve(&self.started, Signal::Failed(error.clone()));
            resolve(&self.stopped, Signal::Failed(error));
            self.stop.cancel();
        }
    }

    /// Wait until the subscription is confirmed.
    pub async fn started(&self) -> HarnessResult<()> {
        wait(&self.started).await
    }

    /// Wait until teardown completed.
    pub async fn fully_stopped(&self) -> HarnessResult<()> {
        wait(&self.stopped).await
    }
}

impl fmt::Debug for ConsumerGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerGeneration")
            .field("consumer_tag", &self.consumer_tag)
            .field("state", &self.state())
            .finish()
    }
}

/// Single assignment: only a pending signal is resolved.
fn resolve(signal: &watch::Sender<Signal>, value: Signal) {
    signal.send_if_modified(|current| {
        if matches!(current, Signal::Pending) {
            *current = value;
            true
        } else {
            false
        }
    });
}

async fn wait(signal: &watch::Sender<Signal>) -> HarnessResult<()> {
    let mut rx = signal.subscribe();
    let resolved = match rx.wait_for(|s| !matches!(s, Signal::Pending)).await {
        Ok(value) => value.clone(),
        Err(_) => return Err(HarnessError::Cancelled),
    };
    match resolved {
        Signal::Ready => Ok(()),
        Signal::Cancelled | Signal::Pending => Err(HarnessError::Cancelled),
        Signal::Failed(error) => Err(error),
    }
}
