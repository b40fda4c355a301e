//! Decision policies: the *when* of a fault.
//!
//! A policy is consulted once per intercepted operation and yields the
//! fault to inject, if any. All policies are safe to share across tasks;
//! the ones that carry a cursor or counter synchronise internally.

use chrono::{DateTime, Datelike, Utc, Weekday};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Fault, FaultContext, ValidationReport};

/// Decides, per operation, whether to inject a fault and which one.
pub struct Policy {
    kind: Kind,
}

enum Kind {
    Probabilistic {
        probability: f64,
        seed: Option<i64>,
        faults: Vec<Fault>,
        rng: Mutex<StdRng>,
    },
    Deterministic {
        pattern: Pattern,
        fault: Fault,
        cursor: AtomicU64,
    },
    Threshold {
        fault: Fault,
        min_count: u64,
        max_count: Option<u64>,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
        allowed_days: Option<HashSet<Weekday>>,
        counter: AtomicU64,
    },
}

#[derive(Clone, Debug)]
enum Pattern {
    FirstN(u64),
    EveryN(u64),
    Alternate,
    Sequence(Arc<Vec<bool>>),
}

// === impl Policy ===

impl Policy {
    /// Injects `fault` with probability `probability` per evaluation.
    pub fn probabilistic(probability: f64, fault: Fault) -> Self {
        Self::probabilistic_choice(probability, vec![fault])
    }

    /// Injects with probability `probability`, choosing uniformly among
    /// `faults`.
    pub fn probabilistic_choice(probability: f64, faults: Vec<Fault>) -> Self {
        Self {
            kind: Kind::Probabilistic {
                probability,
                seed: None,
                faults,
                rng: Mutex::new(StdRng::from_entropy()),
            },
        }
    }

    /// Seeds the probabilistic generator for reproducible runs. Negative
    /// seeds are rejected by the configuration validator.
    pub fn with_seed(mut self, seed: i64) -> Self {
        if let Kind::Probabilistic {
            seed: slot, rng, ..
        } = &mut self.kind
        {
            *slot = Some(seed);
            if seed >= 0 {
                *rng.get_mut() = StdRng::seed_from_u64(seed as u64);
            }
        }
        self
    }

    /// Cycles an explicit boolean sequence; `true` positions inject.
    pub fn deterministic(sequence: Vec<bool>, fault: Fault) -> Self {
        Self::from_pattern(Pattern::Sequence(Arc::new(sequence)), fault)
    }

    /// Injects on the first `n` evaluations, then never again.
    pub fn fail_first_n(n: u64, fault: Fault) -> Self {
        Self::from_pattern(Pattern::FirstN(n), fault)
    }

    /// Injects on every `n`th evaluation.
    pub fn fail_every_n(n: u64, fault: Fault) -> Self {
        Self::from_pattern(Pattern::EveryN(n), fault)
    }

    /// Injects on every other evaluation, starting with the first.
    pub fn alternate(fault: Fault) -> Self {
        Self::from_pattern(Pattern::Alternate, fault)
    }

    fn from_pattern(pattern: Pattern, fault: Fault) -> Self {
        Self {
            kind: Kind::Deterministic {
                pattern,
                fault,
                cursor: AtomicU64::new(0),
            },
        }
    }

    /// Injects while the evaluation counter lies in `[min_count,
    /// max_count)`. Combine with [`Policy::between`] and
    /// [`Policy::on_days`] to add wall-clock windows.
    pub fn threshold(min_count: u64, max_count: Option<u64>, fault: Fault) -> Self {
        Self {
            kind: Kind::Threshold {
                fault,
                min_count,
                max_count,
                not_before: None,
                not_after: None,
                allowed_days: None,
                counter: AtomicU64::new(0),
            },
        }
    }

    /// Injects on the first `n` evaluations.
    pub fn first_n(n: u64, fault: Fault) -> Self {
        Self::threshold(0, Some(n), fault)
    }

    /// Injects from the `n`th evaluation onward.
    pub fn after_n(n: u64, fault: Fault) -> Self {
        Self::threshold(n, None, fault)
    }

    /// Injects for `duration`, starting now.
    pub fn for_duration(duration: Duration, fault: Fault) -> Self {
        let now = Utc::now();
        Self::threshold(0, None, fault).between(Some(now), Some(now + duration))
    }

    /// Restricts a threshold policy to a wall-clock window.
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        if let Kind::Threshold {
            not_before,
            not_after,
            ..
        } = &mut self.kind
        {
            *not_before = start;
            *not_after = end;
        }
        self
    }

    /// Restricts a threshold policy to the given weekdays.
    pub fn on_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        if let Kind::Threshold { allowed_days, .. } = &mut self.kind {
            *allowed_days = Some(days.into_iter().collect());
        }
        self
    }

    /// Rewinds cursors and counters (and reseeds a seeded generator) so a
    /// policy can be reused across test runs.
    pub fn reset(&self) {
        match &self.kind {
            Kind::Probabilistic { seed, rng, .. } => {
                if let Some(seed) = seed {
                    if *seed >= 0 {
                        *rng.lock() = StdRng::seed_from_u64(*seed as u64);
                    }
                }
            }
            Kind::Deterministic { cursor, .. } => cursor.store(0, Ordering::Relaxed),
            Kind::Threshold { counter, .. } => counter.store(0, Ordering::Relaxed),
        }
    }

    /// Evaluates the policy for one intercepted operation.
    pub fn decide(&self, _context: &FaultContext) -> Option<Fault> {
        match &self.kind {
            Kind::Probabilistic {
                probability,
                faults,
                rng,
                ..
            } => {
                if faults.is_empty() {
                    return None;
                }
                let mut rng = rng.lock();
                if rng.gen::<f64>() >= *probability {
                    return None;
                }
                let choice = if faults.len() == 1 {
                    0
                } else {
                    rng.gen_range(0..faults.len())
                };
                Some(faults[choice].clone())
            }
            Kind::Deterministic {
                pattern,
                fault,
                cursor,
            } => {
                let n = cursor.fetch_add(1, Ordering::Relaxed);
                let inject = match pattern {
                    Pattern::FirstN(k) => n < *k,
                    Pattern::EveryN(k) => *k != 0 && (n + 1) % *k == 0,
                    Pattern::Alternate => n % 2 == 0,
                    Pattern::Sequence(seq) => {
                        !seq.is_empty() && seq[(n % seq.len() as u64) as usize]
                    }
                };
                inject.then(|| fault.clone())
            }
            Kind::Threshold {
                fault,
                min_count,
                max_count,
                not_before,
                not_after,
                allowed_days,
                counter,
            } => {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                if n < *min_count || max_count.map_or(false, |max| n >= max) {
                    return None;
                }
                let now = Utc::now();
                if not_before.map_or(false, |start| now < start)
                    || not_after.map_or(false, |end| now >= end)
                {
                    return None;
                }
                if let Some(days) = allowed_days {
                    if !days.contains(&now.weekday()) {
                        return None;
                    }
                }
                Some(fault.clone())
            }
        }
    }

    pub(crate) fn check(&self, scope: &str, report: &mut ValidationReport) {
        match &self.kind {
            Kind::Probabilistic {
                probability,
                seed,
                faults,
                ..
            } => {
                if !(0.0..=1.0).contains(probability) {
                    report
                        .errors
                        .push(format!("{scope}: probability {probability} is outside [0, 1]"));
                } else if *probability >= 0.9 {
                    report.warnings.push(format!(
                        "{scope}: probability {probability} will fault nearly every operation"
                    ));
                }
                if let Some(seed) = seed {
                    if *seed < 0 {
                        report.errors.push(format!("{scope}: seed {seed} is negative"));
                    }
                }
                if faults.is_empty() {
                    report
                        .errors
                        .push(format!("{scope}: no fault strategies configured"));
                }
                let mut names = HashSet::new();
                for fault in faults {
                    if !names.insert(fault.name()) {
                        report.errors.push(format!(
                            "{scope}: duplicate strategy name '{}'",
                            fault.name()
                        ));
                    }
                    fault.check(scope, report);
                }
            }
            Kind::Deterministic { pattern, fault, .. } => {
                match pattern {
                    Pattern::Sequence(seq) if seq.is_empty() => {
                        report
                            .errors
                            .push(format!("{scope}: decision sequence is empty"));
                    }
                    Pattern::EveryN(0) => {
                        report
                            .errors
                            .push(format!("{scope}: fail-every-n requires n > 0"));
                    }
                    _ => {}
                }
                fault.check(scope, report);
            }
            Kind::Threshold {
                fault,
                min_count,
                max_count,
                not_before,
                not_after,
                allowed_days,
                ..
            } => {
                if let Some(max) = max_count {
                    if max < min_count {
                        report.errors.push(format!(
                            "{scope}: count bounds are inverted ({min_count} >= {max})"
                        ));
                    }
                }
                if let (Some(start), Some(end)) = (not_before, not_after) {
                    if end <= start {
                        report
                            .errors
                            .push(format!("{scope}: time window is inverted"));
                    }
                }
                if let Some(days) = allowed_days {
                    if days.is_empty() {
                        report
                            .errors
                            .push(format!("{scope}: allowed day-of-week set is empty"));
                    }
                }
                fault.check(scope, report);
            }
        }
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Probabilistic { probability, .. } => f
                .debug_struct("Policy::Probabilistic")
                .field("probability", probability)
                .finish_non_exhaustive(),
            Kind::Deterministic { pattern, .. } => f
                .debug_struct("Policy::Deterministic")
                .field("pattern", pattern)
                .finish_non_exhaustive(),
            Kind::Threshold {
                min_count,
                max_count,
                ..
            } => f
                .debug_struct("Policy::Threshold")
                .field("min_count", min_count)
                .field("max_count", max_count)
                .finish_non_exhaustive(),
        }
    }
}
