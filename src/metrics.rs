use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live numbers shown while typing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveMetrics {
    pub wpm: f64,
    pub accuracy: f64,
    pub peak_wpm: f64,
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self {
            wpm: 0.0,
            accuracy: 100.0,
            peak_wpm: 0.0,
        }
    }
}

/// Positional accuracy in percent, rounded. An empty input is 100.
pub fn accuracy(input: &[char], target: &[char]) -> f64 {
    if input.is_empty() {
        return 100.0;
    }
    let correct = input
        .iter()
        .zip(target.iter())
        .filter(|(typed, expected)| typed == expected)
        .count();

    (100.0 * correct as f64 / input.len() as f64).round()
}

pub fn word_count(input: &str) -> usize {
    input.split_whitespace().count()
}

/// Words per minute, rounded. Never NaN or infinite.
pub fn wpm(input: &str, elapsed_minutes: f64) -> f64 {
    let wpm = (word_count(input.trim()) as f64 / elapsed_minutes).round();
    if wpm.is_finite() && wpm >= 0.0 {
        wpm
    } else {
        0.0
    }
}

pub fn elapsed_minutes(started_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - started_at).num_milliseconds().max(0) as f64 / 60_000.0
}

/// Recomputes live metrics from current state. Keeps the running peak.
#[derive(Debug, Clone, Default)]
pub struct LiveMetricsEngine {
    current: LiveMetrics,
}

impl LiveMetricsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recompute(
        &mut self,
        input: &[char],
        target: &[char],
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> LiveMetrics {
        let Some(started_at) = started_at else {
            return self.current;
        };

        let text: String = input.iter().collect();
        let wpm = wpm(&text, elapsed_minutes(started_at, now));
        self.current = LiveMetrics {
            wpm,
            accuracy: accuracy(input, target),
            peak_wpm: self.current.peak_wpm.max(wpm),
        };
        self.current
    }

    pub fn current(&self) -> LiveMetrics {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_accuracy_empty_is_100() {
        assert_eq!(accuracy(&[], &chars("abc")), 100.0);
    }

    #[test]
    fn test_accuracy_positional() {
        assert_eq!(accuracy(&chars("abc"), &chars("abc")), 100.0);
        assert_eq!(accuracy(&chars("axc"), &chars("abc")), 67.0);
        assert_eq!(accuracy(&chars("xyz"), &chars("abc")), 0.0);
    }

    #[test]
    fn test_accuracy_trailing_input_never_matches() {
        assert_eq!(accuracy(&chars("abcd"), &chars("abc")), 75.0);
        assert_eq!(accuracy(&chars("ab"), &[]), 0.0);
    }

    #[test]
    fn test_word_count_splits_on_whitespace_runs() {
        assert_eq!(word_count("the  quick\tbrown\nfox"), 4);
        assert_eq!(word_count("   "), 0);
        assert_eq!(word_count("مرحبا بالعالم"), 2);
    }

    #[test]
    fn test_wpm_guards_zero_elapsed() {
        assert_eq!(wpm("hello world", 0.0), 0.0);
        assert_eq!(wpm("", 0.0), 0.0);
        assert_eq!(wpm("hello world", 0.5), 4.0);
        assert_eq!(wpm(" one two three ", 1.0), 3.0);
    }

    #[test]
    fn test_engine_holds_defaults_until_started() {
        let mut engine = LiveMetricsEngine::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

        let m = engine.recompute(&chars("ab"), &chars("ab"), None, now);
        assert_eq!(m, LiveMetrics::default());
        assert_eq!(m.accuracy, 100.0);
        assert_eq!(m.wpm, 0.0);
    }

    #[test]
    fn test_engine_tracks_peak() {
        let mut engine = LiveMetricsEngine::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let target = chars("aa bb cc");

        let m = engine.recompute(&chars("aa bb"), &target, Some(t0), t0 + Duration::seconds(6));
        assert_eq!(m.wpm, 20.0);
        assert_eq!(m.peak_wpm, 20.0);

        let m = engine.recompute(&chars("aa bb c"), &target, Some(t0), t0 + Duration::seconds(60));
        assert_eq!(m.wpm, 3.0);
        assert_eq!(m.peak_wpm, 20.0);
        assert_eq!(engine.current().peak_wpm, 20.0);
    }
}
