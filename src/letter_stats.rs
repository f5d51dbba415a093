use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::keystroke::Keystroke;
use crate::util::mean;

/// Per-letter accumulator, keyed by the expected character.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LetterStat {
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub latencies_ms: Vec<i64>,
    pub total_latency_ms: i64,
    pub errors: HashMap<char, u32>,
}

impl LetterStat {
    pub fn avg_time_ms(&self) -> f64 {
        let samples: Vec<f64> = self.latencies_ms.iter().map(|&ms| ms as f64).collect();
        mean(&samples).unwrap_or(0.0)
    }

    pub fn attempts(&self) -> u32 {
        self.correct_count + self.incorrect_count
    }

    pub fn miss_rate(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            n => self.incorrect_count as f64 / n as f64 * 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Substitution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPattern {
    /// `"expected→typed"`
    pub pattern: String,
    pub expected: char,
    pub typed: char,
    pub count: u32,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

/// Flattened letter stat as submitted with the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterSummary {
    pub letter: char,
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub avg_time_ms: f64,
    pub total_time_ms: i64,
    pub errors: BTreeMap<char, u32>,
}

fn pattern_key(expected: char, typed: char) -> String {
    format!("{expected}→{typed}")
}

/// Builds letter stats and substitution patterns from the keystroke log.
#[derive(Debug, Clone, Default)]
pub struct LetterStatsAggregator {
    letters: HashMap<char, LetterStat>,
    patterns: HashMap<String, ErrorPattern>,
}

impl LetterStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one keystroke in. `previous` is the keystroke logged just before
    /// it, whatever letter it was for.
    pub fn apply(&mut self, keystroke: &Keystroke, previous: Option<&Keystroke>) {
        if keystroke.is_backspace() {
            return;
        }
        let (Some(expected), Some(typed)) = (keystroke.expected, keystroke.key.typed_char()) else {
            return;
        };

        let stat = self.letters.entry(expected).or_default();
        if let Some(prev) = previous {
            let latency = (keystroke.timestamp - prev.timestamp).max(0);
            stat.latencies_ms.push(latency);
            stat.total_latency_ms += latency;
        }

        if keystroke.correct {
            stat.correct_count += 1;
            return;
        }

        stat.incorrect_count += 1;
        *stat.errors.entry(typed).or_insert(0) += 1;

        self.patterns
            .entry(pattern_key(expected, typed))
            .or_insert_with(|| ErrorPattern {
                pattern: pattern_key(expected, typed),
                expected,
                typed,
                count: 0,
                kind: ErrorKind::Substitution,
            })
            .count += 1;
    }

    pub fn get(&self, letter: char) -> Option<&LetterStat> {
        self.letters.get(&letter)
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    pub fn summaries(&self) -> Vec<LetterSummary> {
        self.letters
            .iter()
            .sorted_by_key(|(letter, _)| **letter)
            .map(|(&letter, stat)| LetterSummary {
                letter,
                correct_count: stat.correct_count,
                incorrect_count: stat.incorrect_count,
                avg_time_ms: stat.avg_time_ms(),
                total_time_ms: stat.total_latency_ms,
                errors: stat.errors.iter().map(|(&c, &n)| (c, n)).collect(),
            })
            .collect()
    }

    /// Patterns ordered by frequency, most common first.
    pub fn error_patterns(&self) -> Vec<ErrorPattern> {
        self.patterns
            .values()
            .cloned()
            .sorted_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)))
            .collect()
    }

    /// Letters with the highest miss rate, for the results screen.
    pub fn weakest(&self, n: usize) -> Vec<(char, f64)> {
        self.letters
            .iter()
            .filter(|(_, s)| s.incorrect_count > 0)
            .map(|(&c, s)| (c, s.miss_rate()))
            .sorted_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            })
            .take(n)
            .collect()
    }
}
