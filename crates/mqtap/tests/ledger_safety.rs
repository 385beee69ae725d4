// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::items_after_statements)] // Test helpers

//! Exhaustive settlement check of the ack ledger.
//!
//! Every combination of delivery round, claim, completion round and outcome
//! for a handful of deliveries is replayed against a strict channel that
//! rejects settling a tag twice, batch-rejecting over a claimed tag, and
//! leaving any tag unsettled.

use mqtap::{AckLedger, Settlement};
use std::collections::BTreeSet;

const MESSAGES: usize = 4;
/// Teardowns happen at the end of rounds `0..ROUNDS`; round `ROUNDS` comes after the last one.
const ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy)]
enum Fate {
    Unclaimed,
    Claimed { end_round: usize, result: Settlement },
}

#[derive(Default)]
struct StrictChannel {
    delivered: u64,
    settled: BTreeSet<u64>,
    processing: BTreeSet<u64>,
}

impl StrictChannel {
    fn settle(&mut self, tag: u64, what: &str) -> Result<(), String> {
        if tag == 0 || tag > self.delivered {
            return Err(format!("{} of undelivered tag {}", what, tag));
        }
        if self.processing.contains(&tag) {
            return Err(format!("{} of claimed tag {}", what, tag));
        }
        if !self.settled.insert(tag) {
            return Err(format!("{} of settled tag {}", what, tag));
        }
        Ok(())
    }

    fn nack_multiple(&mut self, tag: u64) -> Result<(), String> {
        self.settle(tag, "batch nack")?;
        for lower in 1..tag {
            if self.processing.contains(&lower) {
                return Err(format!("batch nack {} covers claimed tag {}", tag, lower));
            }
            self.settled.insert(lower);
        }
        Ok(())
    }
}

fn fates(start_round: usize) -> Vec<Fate> {
    use Settlement::{Acked, AlreadyNacked, ShouldNack};

    let mut fates = vec![Fate::Unclaimed];
    for end_round in start_round..=ROUNDS {
        let results: &[Settlement] = if end_round == start_round {
            &[Acked, ShouldNack]
        } else if end_round == ROUNDS {
            &[Acked, AlreadyNacked]
        } else {
            &[Acked, ShouldNack, AlreadyNacked]
        };
        for &result in results {
            fates.push(Fate::Claimed { end_round, result });
        }
    }
    fates
}

fn simulate(start_rounds: &[usize], fates: &[Fate]) -> Result<(), String> {
    let mut ledger = AckLedger::new();
    let mut channel = StrictChannel::default();

    for round in 0..=ROUNDS {
        for (index, (&start, fate)) in start_rounds.iter().zip(fates).enumerate() {
            let tag = index as u64 + 1;
            if start != round {
                continue;
            }
            channel.delivered = tag;
            ledger.observe(tag);
            if let Fate::Claimed { .. } = fate {
                channel.processing.insert(tag);
                ledger.start_processing(tag);
            }
        }

        for (index, fate) in fates.iter().enumerate() {
            let tag = index as u64 + 1;
            let Fate::Claimed { end_round, result } = *fate else {
                continue;
            };
            if end_round != round {
                continue;
            }
            channel.processing.remove(&tag);
            match result {
                Settlement::Acked => channel.settle(tag, "ack")?,
                Settlement::AlreadyNacked => channel.settle(tag, "nack")?,
                Settlement::ShouldNack => {}
            }
            ledger
                .end_processing(tag, result)
                .map_err(|err| err.to_string())?;
        }

        if round < ROUNDS {
            let plan = ledger.teardown();
            if let Some(batch) = plan.batch() {
                channel.nack_multiple(batch)?;
            }
            for &tag in &plan.single {
                channel.settle(tag, "nack")?;
            }
        }
    }

    let expected: BTreeSet<u64> = (1..=channel.delivered).collect();
    if channel.settled != expected {
        return Err(format!(
            "unsettled tags: {:?}",
            expected.difference(&channel.settled).collect::<Vec<_>>()
        ));
    }
    Ok(())
}

/// Nondecreasing delivery rounds for every message.
fn start_round_sequences() -> Vec<Vec<usize>> {
    fn extend(prefix: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if prefix.len() == MESSAGES {
            out.push(prefix.clone());
            return;
        }
        let lowest = prefix.last().copied().unwrap_or(0);
        for round in lowest..ROUNDS {
            prefix.push(round);
            extend(prefix, out);
            prefix.pop();
        }
    }

    let mut out = Vec::new();
    extend(&mut Vec::new(), &mut out);
    out
}

#[test]
fn test_every_schedule_settles_each_tag_once() {
    let mut checked = 0usize;

    for start_rounds in start_round_sequences() {
        let choices: Vec<Vec<Fate>> = start_rounds.iter().map(|&r| fates(r)).collect();
        let mut odometer = vec![0usize; MESSAGES];

        loop {
            let selected: Vec<Fate> = odometer
                .iter()
                .zip(&choices)
                .map(|(&i, options)| options[i])
                .collect();
            if let Err(failure) = simulate(&start_rounds, &selected) {
                panic!(
                    "rounds {:?} fates {:?}: {}",
                    start_rounds, selected, failure
                );
            }
            checked += 1;

            let mut position = 0;
            loop {
                if position == MESSAGES {
                    break;
                }
                odometer[position] += 1;
                if odometer[position] < choices[position].len() {
                    break;
                }
                odometer[position] = 0;
                position += 1;
            }
            if position == MESSAGES {
                break;
            }
        }
    }

    assert!(checked > 10_000, "only {} schedules checked", checked);
}

#[test]
fn test_late_failure_across_generations() {
    // Claimed in generation 0, failed while generation 1 runs.
    let fates = [
        Fate::Claimed {
            end_round: 1,
            result: Settlement::ShouldNack,
        },
        Fate::Unclaimed,
        Fate::Claimed {
            end_round: 2,
            result: Settlement::Acked,
        },
        Fate::Unclaimed,
    ];
    simulate(&[0, 0, 1, 1], &fates).expect("settles");
}
