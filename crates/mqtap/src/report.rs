// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timeout diagnostics.

use std::fmt;
use std::time::Duration;

/// Maximum number of entries kept in each diagnostic sample list.
pub const SAMPLE_CAP: usize = 10;

/// Why a waiter gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The deadline passed while the caller was awaiting and nothing matched.
    AfterAwait,
    /// An unmatched message sat in the buffer past the deadline and the
    /// whole generation was shut down.
    UnackedMessage,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterAwait => write!(f, "after await"),
            Self::UnackedMessage => write!(f, "unacked message"),
        }
    }
}

/// Diagnostic snapshot of a waiter that never matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutReport {
    /// Caller description of the awaited message.
    pub description: String,
    /// Coordinator context label (queue URL or test name).
    pub context: String,
    pub reason: TimeoutReason,
    pub timeout: Duration,
    /// Deliveries this waiter evaluated, malformed ones included.
    pub message_count: usize,
    /// Raw bodies of evaluated, non-matching messages.
    pub observed: Vec<String>,
    /// Raw bodies that could not be decoded.
    pub malformed: Vec<String>,
    /// Errors raised by the predicate.
    pub predicate_failures: Vec<String>,
    /// `(prefetch_count, last_observed_tag)` when the prefetch window was exhausted.
    pub prefetch: Option<(u16, u64)>,
}

impl fmt::Display for TimeoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Expected:")?;
        writeln!(f, "\ta message matching `{}`", self.description)?;
        writeln!(f, "Actual:")?;
        writeln!(f, "\tmessages = {}", quoted_list(&self.observed))?;
        writeln!(f, "Context:")?;
        if !self.malformed.is_empty() {
            writeln!(f, "\tmalformedMessages = {}", quoted_list(&self.malformed))?;
        }
        if !self.predicate_failures.is_empty() {
            writeln!(
                f,
                "\tpredicateFailures = {}",
                quoted_list(&self.predicate_failures)
            )?;
        }
        writeln!(f, "\tmessageCount = {}", self.message_count)?;
        writeln!(f, "\ttimeout = \"{}\"", human_readable(self.timeout))?;
        if let Some((prefetch_count, last_observed)) = self.prefetch {
            writeln!(
                f,
                "\tprefetchCount = {} (last delivery tag {})",
                prefetch_count, last_observed
            )?;
        }
        writeln!(f, "\tcontext = \"{}\"", self.context)?;
        write!(f, "\ttimeoutReason = \"{}\"", self.reason)
    }
}

fn quoted_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| format!("{:?}", item)).collect();
    format!("[{}]", quoted.join(", "))
}

/// Render a duration the way test output reads best.
pub fn human_readable(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 1 {
        return "1 millisecond".to_string();
    }
    if millis < 10_000 {
        return format!("{} milliseconds", millis);
    }
    let seconds = millis / 1000;
    if seconds < 600 {
        return format!("{} seconds", seconds);
    }
    let minutes = seconds / 60;
    if minutes < 600 {
        return format!("{} minutes", minutes);
    }
    format!("{} hours", minutes / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> TimeoutReport {
        TimeoutReport {
            description: "id == 2".into(),
            context: "orders".into(),
            reason: TimeoutReason::UnackedMessage,
            timeout: Duration::from_millis(50),
            message_count: 2,
            observed: vec![r#"{"id":1}"#.into()],
            malformed: vec!["garbage".into()],
            predicate_failures: Vec::new(),
            prefetch: None,
        }
    }

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(Duration::from_millis(1)), "1 millisecond");
        assert_eq!(human_readable(Duration::from_millis(0)), "0 milliseconds");
        assert_eq!(human_readable(Duration::from_millis(5000)), "5000 milliseconds");
        assert_eq!(human_readable(Duration::from_secs(10)), "10 seconds");
        assert_eq!(human_readable(Duration::from_secs(599)), "599 seconds");
        assert_eq!(human_readable(Duration::from_secs(600)), "10 minutes");
        assert_eq!(human_readable(Duration::from_secs(36_000)), "10 hours");
    }

    #[test]
    fn test_report_display() {
        let text = report().to_string();
        assert!(text.contains("a message matching `id == 2`"));
        assert!(text.contains(r#"messages = ["{\"id\":1}"]"#));
        assert!(text.contains(r#"malformedMessages = ["garbage"]"#));
        assert!(text.contains("timeout = \"50 milliseconds\""));
        assert!(text.contains("timeoutReason = \"unacked message\""));
        assert!(!text.contains("predicateFailures"));
        assert!(!text.contains("prefetchCount"));
    }

    #[test]
    fn test_report_prefetch_context() {
        let mut report = report();
        report.reason = TimeoutReason::AfterAwait;
        report.prefetch = Some((4, 4));
        let text = report.to_string();
        assert!(text.contains("prefetchCount = 4 (last delivery tag 4)"));
        assert!(text.contains("timeoutReason = \"after await\""));
    }
}
