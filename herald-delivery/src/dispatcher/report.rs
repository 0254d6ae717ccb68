use std::fmt;

use serde::Serialize;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Retried,
    DeadLettered,
    /// The claim was given back without counting an error.
    Released,
    /// The claim was lost before the outcome could be written.
    Stale,
    /// A storage or sink error prevented recording the outcome.
    Failed,
}

/// Tally of one dispatcher cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub released: usize,
    pub stale: usize,
    pub failed: usize,
}

impl CycleReport {
    pub const fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Released => self.released += 1,
            Outcome::Stale => self.stale += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    /// Nothing was claimed and nothing was swept.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.claimed == 0 && self.dead_lettered == 0
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "claimed={} sent={} retried={} dead_lettered={} released={} stale={} failed={}",
            self.claimed,
            self.sent,
            self.retried,
            self.dead_lettered,
            self.released,
            self.stale,
            self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn outcomes_are_tallied() {
        let mut report = CycleReport {
            claimed: 3,
            ..CycleReport::default()
        };
        report.record(Outcome::Sent);
        report.record(Outcome::Retried);
        report.record(Outcome::Sent);

        assert_eq!(report.sent, 2);
        assert_eq!(report.retried, 1);
        assert!(!report.is_idle());
        assert_eq!(
            report.to_string(),
            "claimed=3 sent=2 retried=1 dead_lettered=0 released=0 stale=0 failed=0"
        );
    }
}
