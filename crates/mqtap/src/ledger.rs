// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery tag settlement ledger.
//!
//! Every message delivered to a stolen consumer must be settled exactly once:
//! acknowledged when its processing callback succeeded, rejected (and thereby
//! requeued for the backup consumers) otherwise. Consumer generations come and
//! go on the same channel while delivery tags keep increasing, so the ledger
//! survives across generations and decides, at each generation teardown, which
//! tags still need a reject.
//!
//! # Algorithm
//!
//! At teardown the ledger knows:
//! - `processing`: tags claimed by a waiter whose callback has not finished
//! - `acked`: tags acknowledged since the last trim
//! - `should_nack`: tags whose callback failed while a teardown was still due
//! - `last_observed`: highest delivered tag
//! - `previously_nacked_through`: `last_observed` of the previous teardown
//!
//! A batch reject (`multiple = true`) settles a tag and every lower unsettled
//! tag, so it is only usable below the oldest claimed tag:
//!
//! ```text
//! tags:    1   2   3   4   5   6
//! state:   .   A   P   .   F   .        (A acked, P processing, F should_nack)
//! batch:   <-2 covers 1 (2 is acked, batch shrinks to 1)
//! single:              4   5   6
//! ```
//!
//! Tags at or below `previously_nacked_through` were already covered by an
//! earlier batch, except those whose failure was recorded afterwards.
//!
//! # Memory
//!
//! After each teardown `should_nack` is emptied and `acked` keeps only tags at
//! or above the oldest claimed tag, so bookkeeping stays proportional to the
//! number of in-flight callbacks.

use std::collections::BTreeSet;
use thiserror::Error;

/// Ledger misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("delivery tag {0} is not being processed")]
    NotProcessing(u64),
}

/// How a processing tag was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged on the broker.
    Acked,
    /// Failed; the next teardown must reject it.
    ShouldNack,
    /// Failed and rejected on the broker directly (no teardown pending).
    AlreadyNacked,
}

/// Rejects to issue at a generation teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NackPlan {
    /// Batch-reject up to and including this tag; zero means no batch.
    pub multiple: u64,
    /// Tags to reject one by one, ascending.
    pub single: Vec<u64>,
}

impl NackPlan {
    /// Tag of the batch reject, if any.
    pub fn batch(&self) -> Option<u64> {
        (self.multiple > 0).then_some(self.multiple)
    }

    pub fn is_empty(&self) -> bool {
        self.multiple == 0 && self.single.is_empty()
    }
}

/// Compute the rejects needed to settle every observed tag.
///
/// Pure function of the ledger state; see the module documentation.
pub fn compute_nacks(
    last_observed: u64,
    previously_nacked_through: u64,
    processing: &BTreeSet<u64>,
    acked: &BTreeSet<u64>,
    should_nack: &BTreeSet<u64>,
) -> NackPlan {
    let mut single = Vec::new();

    let mut multiple = match processing.first() {
        None => last_observed,
        Some(&first_outstanding) => {
            // Older generations' range: only failures recorded after their batch.
            let mut tag = first_outstanding + 1;
            while tag <= previously_nacked_through {
                if should_nack.contains(&tag) {
                    single.push(tag);
                }
                tag += 1;
            }

            // Current generation's range.
            for tag in tag..=last_observed {
                if !acked.contains(&tag) && !processing.contains(&tag) {
                    single.push(tag);
                }
            }

            first_outstanding.saturating_sub(1)
        }
    };

    while multiple > 0 && acked.contains(&multiple) {
        multiple -= 1;
    }

    if multiple > 0 && multiple <= previously_nacked_through {
        multiple = should_nack
            .range(..=multiple)
            .next_back()
            .copied()
            .unwrap_or(0);
    }

    NackPlan { multiple, single }
}

/// Settlement bookkeeping shared by all generations of a coordinator.
#[derive(Debug, Default)]
pub struct AckLedger {
    processing: BTreeSet<u64>,
    acked: BTreeSet<u64>,
    should_nack: BTreeSet<u64>,
    last_observed: u64,
    previously_nacked_through: u64,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery from the broker.
    pub fn observe(&mut self, delivery_tag: u64) {
        self.last_observed = self.last_observed.max(delivery_tag);
    }

    /// Record that a waiter claimed a delivery.
    pub fn start_processing(&mut self, delivery_tag: u64) {
        self.processing.insert(delivery_tag);
    }

    /// Record the outcome of a claimed delivery.
    pub fn end_processing(
        &mut self,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), LedgerError> {
        if !self.processing.remove(&delivery_tag) {
            return Err(LedgerError::NotProcessing(delivery_tag));
        }
        match settlement {
            Settlement::Acked => {
                self.acked.insert(delivery_tag);
            }
            Settlement::ShouldNack => {
                self.should_nack.insert(delivery_tag);
            }
            Settlement::AlreadyNacked => {}
        }
        Ok(())
    }

    /// Compute the rejects for a generation teardown and trim the ledger.
    pub fn teardown(&mut self) -> NackPlan {
        let plan = compute_nacks(
            self.last_observed,
            self.previously_nacked_through,
            &self.processing,
            &self.acked,
            &self.should_nack,
        );

        self.previously_nacked_through = self.last_observed;
        self.should_nack.clear();
        match self.processing.first().copied() {
            None => self.acked.clear(),
            Some(first_outstanding) => self.acked.retain(|&tag| tag >= first_outstanding),
        }

        plan
    }

    pub fn last_observed(&self) -> u64 {
        self.last_observed
    }

    pub fn previously_nacked_through(&self) -> u64 {
        self.previously_nacked_through
    }

    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    pub fn should_nack_count(&self) -> usize {
        self.should_nack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[u64]) -> BTreeSet<u64> {
        tags.iter().copied().collect()
    }

    fn nacks(
        last: u64,
        prev: u64,
        processing: &[u64],
        acked: &[u64],
        should_nack: &[u64],
    ) -> (u64, Vec<u64>) {
        let plan = compute_nacks(last, prev, &set(processing), &set(acked), &set(should_nack));
        (plan.multiple, plan.single)
    }

    #[test]
    fn test_vectors() {
        assert_eq!(nacks(1, 0, &[], &[], &[]), (1, vec![]));
        assert_eq!(nacks(1, 0, &[1], &[], &[]), (0, vec![]));
        assert_eq!(nacks(2, 0, &[1], &[], &[]), (0, vec![2]));
        assert_eq!(nacks(2, 0, &[], &[1], &[]), (2, vec![]));
        assert_eq!(nacks(2, 0, &[], &[], &[2]), (2, vec![]));
        assert_eq!(nacks(6, 5, &[], &[], &[]), (6, vec![]));
        assert_eq!(nacks(5, 5, &[], &[], &[]), (0, vec![]));
        assert_eq!(nacks(6, 5, &[], &[], &[4]), (6, vec![]));
    }

    #[test]
    fn test_nothing_observed() {
        assert_eq!(nacks(0, 0, &[], &[], &[]), (0, vec![]));
    }

    #[test]
    fn test_batch_shrinks_over_acked() {
        assert_eq!(nacks(4, 0, &[], &[3, 4], &[]), (2, vec![]));
        assert_eq!(nacks(2, 0, &[], &[1, 2], &[]), (0, vec![]));
    }

    #[test]
    fn test_late_failure_below_previous_batch() {
        // Tag 3 was processing at the previous teardown and failed afterwards.
        assert_eq!(nacks(5, 5, &[], &[], &[3]), (3, vec![]));
        // Its neighbour 4 is still processing.
        assert_eq!(nacks(5, 5, &[4], &[], &[3]), (3, vec![]));
    }

    #[test]
    fn test_late_failure_after_processing_tag() {
        // The batch must not cover processing tag 3, so 4 goes out alone.
        assert_eq!(nacks(5, 5, &[3], &[], &[4]), (0, vec![4]));
    }

    #[test]
    fn test_singles_after_processing() {
        assert_eq!(nacks(6, 0, &[2], &[4], &[5]), (1, vec![3, 5, 6]));
    }

    #[test]
    fn test_ledger_teardown_trims() {
        let mut ledger = AckLedger::new();
        for tag in 1..=4 {
            ledger.observe(tag);
        }
        ledger.start_processing(2);
        ledger.start_processing(3);
        ledger.end_processing(3, Settlement::Acked).expect("processing");

        let plan = ledger.teardown();
        assert_eq!(plan, NackPlan { multiple: 1, single: vec![4] });
        assert_eq!(ledger.previously_nacked_through(), 4);
        assert_eq!(ledger.acked_count(), 1);
        assert_eq!(ledger.processing_count(), 1);

        ledger.end_processing(2, Settlement::Acked).expect("processing");
        assert_eq!(ledger.processing_count(), 0);
        ledger.observe(5);
        let plan = ledger.teardown();
        assert_eq!(plan, NackPlan { multiple: 5, single: vec![] });
        assert_eq!(ledger.acked_count(), 0);
        assert_eq!(ledger.should_nack_count(), 0);
    }

    #[test]
    fn test_ledger_late_failure_next_teardown() {
        let mut ledger = AckLedger::new();
        ledger.observe(1);
        ledger.start_processing(1);
        assert!(ledger.teardown().is_empty());

        ledger
            .end_processing(1, Settlement::ShouldNack)
            .expect("processing");
        let plan = ledger.teardown();
        assert_eq!(plan.batch(), Some(1));
        assert!(plan.single.is_empty());
    }

    #[test]
    fn test_end_processing_unknown_tag() {
        let mut ledger = AckLedger::new();
        ledger.observe(1);
        assert_eq!(
            ledger.end_processing(1, Settlement::Acked),
            Err(LedgerError::NotProcessing(1))
        );
    }
}
