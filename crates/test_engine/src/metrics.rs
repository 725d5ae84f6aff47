//! Derived typing metrics.
//!
//! All values come from the server-observed keystroke log and the reference
//! text; nothing here trusts a client-supplied total. One word is five
//! characters throughout.

use crate::keystroke::{Keystroke, KeystrokeLog};
use common::MetricSnapshot;

/// Characters per word, the standard typing-test convention.
const CHARS_PER_WORD: f64 = 5.0;

/// Number of equal-count windows the log is partitioned into for the
/// consistency calculation.
const CONSISTENCY_WINDOWS: usize = 10;

/// Below this many computable windows the sample is too thin to judge and
/// consistency reports a neutral 100.
const MIN_WINDOW_SAMPLES: usize = 5;

/// Words-per-minute over an elapsed interval; 0 when no time has passed.
pub fn wpm(chars: u32, elapsed_ms: u64) -> u32 {
    if elapsed_ms == 0 {
        return 0;
    }
    let words = chars as f64 / CHARS_PER_WORD;
    let minutes = elapsed_ms as f64 / 60_000.0;
    (words / minutes).round() as u32
}

/// Percent of typed characters that were correct; 100 on an empty sample.
pub fn accuracy(correct: u32, total: u32) -> u32 {
    if total == 0 {
        return 100;
    }
    ((100.0 * correct as f64) / total as f64).round() as u32
}

/// Evenness of the typing speed: `100 · (1 − CV)` over windowed wpm values,
/// clamped to 0..=100.
pub fn consistency(log: &KeystrokeLog) -> u32 {
    let typed: Vec<&Keystroke> = log.entries().iter().filter(|k| !k.is_deletion()).collect();

    let chunk = typed.len().div_ceil(CONSISTENCY_WINDOWS).max(2);
    let samples: Vec<f64> = typed
        .chunks(chunk)
        .filter_map(|window| {
            let first = window.first()?;
            let last = window.last()?;
            let span_ms = last.ts_ms.saturating_sub(first.ts_ms);
            if span_ms == 0 {
                return None;
            }
            let words = window.len() as f64 / CHARS_PER_WORD;
            let minutes = span_ms as f64 / 60_000.0;
            Some(words / minutes)
        })
        .collect();

    if samples.len() < MIN_WINDOW_SAMPLES {
        return 100;
    }

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if mean == 0.0 {
        return 100;
    }
    let variance =
        samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    let cv = variance.sqrt() / mean;

    (100.0 * (1.0 - cv)).round().clamp(0.0, 100.0) as u32
}

/// Full snapshot over the current log state.
pub fn compute(log: &KeystrokeLog, position: usize, elapsed_ms: u64) -> MetricSnapshot {
    let correct = log.correct_count();
    let incorrect = log.incorrect_count();
    let total = correct + incorrect;

    MetricSnapshot {
        wpm: wpm(correct, elapsed_ms),
        raw_wpm: wpm(total, elapsed_ms),
        accuracy: accuracy(correct, total),
        consistency: consistency(log),
        errors: incorrect,
        correct_chars: correct,
        incorrect_chars: incorrect,
        position,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(strokes: &[(u64, bool)]) -> KeystrokeLog {
        let mut log = KeystrokeLog::new(10_000);
        for (i, (ts_ms, correct)) in strokes.iter().enumerate() {
            log.push(Keystroke {
                ts_ms: *ts_ms,
                key: 'a',
                correct: *correct,
                position: i,
            });
        }
        log
    }

    #[test]
    fn test_wpm_formula() {
        // 60 correct chars over 15 s: (60/5) / (15000/60000) = 48.
        assert_eq!(wpm(60, 15_000), 48);
        // 100 chars over a minute is 20 wpm.
        assert_eq!(wpm(100, 60_000), 20);
    }

    #[test]
    fn test_wpm_zero_elapsed() {
        assert_eq!(wpm(50, 0), 0);
    }

    #[test]
    fn test_accuracy_bounds() {
        assert_eq!(accuracy(0, 0), 100);
        assert_eq!(accuracy(9, 10), 90);
        assert_eq!(accuracy(10, 10), 100);
        assert_eq!(accuracy(1, 3), 33);
    }

    #[test]
    fn test_steady_typing_is_fully_consistent() {
        // 60 strokes at a metronomic 100 ms: every window has the same wpm.
        let strokes: Vec<(u64, bool)> = (0..60).map(|i| (i * 100, true)).collect();
        assert_eq!(consistency(&log_of(&strokes)), 100);
    }

    #[test]
    fn test_uneven_typing_lowers_consistency() {
        // First half at 50 ms per stroke, second half at 400 ms.
        let strokes: Vec<(u64, bool)> = (0..30)
            .map(|i| (i * 50, true))
            .chain((0..30).map(|i| (1_500 + i * 400, true)))
            .collect();
        let value = consistency(&log_of(&strokes));
        assert!(value < 100, "expected < 100, got {}", value);
    }

    #[test]
    fn test_short_log_reports_neutral_consistency() {
        let strokes: Vec<(u64, bool)> = (0..4).map(|i| (i * 100, true)).collect();
        assert_eq!(consistency(&log_of(&strokes)), 100);
    }

    #[test]
    fn test_snapshot_partition_identity() {
        let strokes = [(0, true), (100, false), (200, true), (300, true)];
        let snapshot = compute(&log_of(&strokes), 4, 300);
        assert_eq!(
            snapshot.correct_chars + snapshot.incorrect_chars,
            4,
            "typed strokes must partition into correct and incorrect"
        );
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.accuracy, 75);
        assert!(snapshot.accuracy <= 100);
    }
}
