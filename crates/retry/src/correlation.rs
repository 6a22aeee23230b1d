//! Error correlation analysis
//!
//! Keeps the most recent errors in a bounded window and counts adjacent
//! class pairs. A window dominated by one repeating class (timeout, timeout,
//! timeout) scores close to 1 and points at a systemic upstream problem;
//! a mix of unrelated classes scores low.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::class::ErrorClass;

/// Errors older than this (relative to the newest insert) are dropped.
const CLEANUP_HORIZON: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct ErrorRecord {
    class: ErrorClass,
    at: Instant,
}

/// Bounded, time-windowed error log with pattern statistics.
#[derive(Debug, Clone)]
pub struct ErrorCorrelationAnalyzer {
    window_size: usize,
    window: VecDeque<ErrorRecord>,
    /// Adjacent-pair observations, accumulated across inserts
    patterns: HashMap<(ErrorClass, ErrorClass), u64>,
    /// Every error ever recorded, by class
    totals: HashMap<ErrorClass, u64>,
}

impl Default for ErrorCorrelationAnalyzer {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ErrorCorrelationAnalyzer {
    /// A `window_size` of zero is treated as one.
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            window: VecDeque::with_capacity(window_size + 1),
            patterns: HashMap::new(),
            totals: HashMap::new(),
        }
    }

    /// Record an error observed at `at`.
    ///
    /// Prunes records older than one hour before `at`, appends, trims the
    /// window to `window_size`, then counts every adjacent pair currently in
    /// the window.
    pub fn add_error(&mut self, class: ErrorClass, at: Instant) {
        if let Some(cutoff) = at.checked_sub(CLEANUP_HORIZON) {
            self.window.retain(|record| record.at > cutoff);
        }

        *self.totals.entry(class.clone()).or_insert(0) += 1;
        self.window.push_back(ErrorRecord { class, at });
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        for (first, second) in self.window.iter().zip(self.window.iter().skip(1)) {
            *self
                .patterns
                .entry((first.class.clone(), second.class.clone()))
                .or_insert(0) += 1;
        }
    }

    /// Correlation in `[0, 1]`.
    ///
    /// Half the weight is the share of repeated pairs (same class twice in a
    /// row), half is `1 / distinct pairs`. Zero until a pair has been seen.
    pub fn correlation_score(&self) -> f64 {
        let total: u64 = self.patterns.values().sum();
        if total == 0 {
            return 0.0;
        }

        let repeated: u64 = self
            .patterns
            .iter()
            .filter(|((first, second), _)| first == second)
            .map(|(_, count)| count)
            .sum();
        let unique = self.patterns.len() as f64;

        let correlation = repeated as f64 / total as f64 + 1.0 / unique;
        (correlation / 2.0).min(1.0)
    }

    /// Most frequent class in the current window.
    ///
    /// Ties go to the class whose latest occurrence is most recent.
    pub fn dominant_error(&self) -> Option<&ErrorClass> {
        let mut counts: HashMap<&ErrorClass, (usize, usize)> = HashMap::new();
        for (position, record) in self.window.iter().enumerate() {
            let entry = counts.entry(&record.class).or_insert((0, position));
            entry.0 += 1;
            entry.1 = position;
        }
        counts
            .into_iter()
            .max_by_key(|(_, (count, last_seen))| (*count, *last_seen))
            .map(|(class, _)| class)
    }

    /// Relative frequency of each observed adjacent pair.
    pub fn error_patterns(&self) -> HashMap<(ErrorClass, ErrorClass), f64> {
        let total: u64 = self.patterns.values().sum();
        if total == 0 {
            return HashMap::new();
        }
        self.patterns
            .iter()
            .map(|(pair, count)| (pair.clone(), *count as f64 / total as f64))
            .collect()
    }

    /// Share of each class among all errors ever recorded.
    pub fn error_distribution(&self) -> HashMap<ErrorClass, f64> {
        let total: u64 = self.totals.values().sum();
        if total == 0 {
            return HashMap::new();
        }
        self.totals
            .iter()
            .map(|(class, count)| (class.clone(), *count as f64 / total as f64))
            .collect()
    }

    /// Classes currently in the window, oldest first.
    pub fn window(&self) -> impl Iterator<Item = &ErrorClass> {
        self.window.iter().map(|record| &record.class)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
