//! Bounded-window spike detection.
//!
//! Given the last `capacity` readings of one agent, the newest value is
//! compared to the mean of the ones before it. Nothing fires until the window
//! is full.

use crate::models::WINDOW_CAPACITY;
use std::collections::VecDeque;

pub const DEFAULT_THRESHOLD: f64 = 5.0;

/// Spike found by `SlidingWindowDetector::observe`, values rounded to 2 decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeAlert {
    pub avg: f64,
    pub deviation: f64,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowDetector {
    capacity: usize,
    threshold: f64,
}

impl Default for SlidingWindowDetector {
    fn default() -> Self {
        Self::new(WINDOW_CAPACITY, DEFAULT_THRESHOLD)
    }
}

impl SlidingWindowDetector {
    /// `capacity` is clamped to 2 so a "previous readings" mean always exists.
    pub fn new(capacity: usize, threshold: f64) -> Self {
        Self { capacity: capacity.max(2), threshold }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `value` (evicting the oldest entries beyond capacity) and
    /// checks it against the mean of the other readings in the window.
    ///
    /// Non-finite values leave the window untouched and never alert.
    pub fn observe(&self, window: &mut VecDeque<f64>, value: f64) -> Option<SpikeAlert> {
        if !value.is_finite() {
            return None;
        }

        window.push_back(value);
        while window.len() > self.capacity {
            window.pop_front();
        }
        if window.len() < self.capacity {
            return None;
        }

        let previous = window.len() - 1;
        let avg = window.iter().take(previous).sum::<f64>() / previous as f64;
        let deviation = (value - avg).abs();
        if deviation <= self.threshold {
            return None;
        }

        let (avg, deviation) = (round2(avg), round2(deviation));
        Some(SpikeAlert {
            avg,
            deviation,
            message: format!("Spike detected: avg={avg:.2}, deviation={deviation:.2}"),
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(detector: &SlidingWindowDetector, readings: &[f64]) -> (VecDeque<f64>, Vec<Option<SpikeAlert>>) {
        let mut window = VecDeque::new();
        let alerts = readings.iter().map(|r| detector.observe(&mut window, *r)).collect();
        (window, alerts)
    }

    #[test]
    fn test_spike_on_tenth_reading() {
        let detector = SlidingWindowDetector::default();
        let (window, alerts) = feed(&detector, &[100.0, 101.0, 99.0, 102.0, 98.0, 103.0, 97.0, 104.0, 96.0, 120.0]);

        assert_eq!(window.len(), 10);
        assert!(alerts[..9].iter().all(Option::is_none));
        let alert = alerts[9].clone().expect("alert on the 10th reading");
        assert_eq!(alert.avg, 100.0);
        assert_eq!(alert.deviation, 20.0);
        assert!(alert.message.contains("avg=100.00"));
        assert!(alert.message.contains("deviation=20.00"));
    }

    #[test]
    fn test_small_deviation_does_not_alert() {
        let detector = SlidingWindowDetector::default();
        let (_, alerts) = feed(&detector, &[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 102.0]);
        assert!(alerts.iter().all(Option::is_none));
    }

    #[test]
    fn test_never_alerts_before_window_is_full() {
        let detector = SlidingWindowDetector::default();
        let (_, alerts) = feed(&detector, &[0.0, 500.0, -500.0, 1000.0, 0.0, 900.0, -900.0, 0.0, 750.0]);
        assert!(alerts.iter().all(Option::is_none));
    }

    #[test]
    fn test_window_evicts_oldest_first() {
        let detector = SlidingWindowDetector::default();
        let readings: Vec<f64> = (1..=15).map(f64::from).collect();
        let (window, _) = feed(&detector, &readings);
        assert_eq!(window.len(), 10);
        assert_eq!(window.front(), Some(&6.0));
        assert_eq!(window.back(), Some(&15.0));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let detector = SlidingWindowDetector::default();
        let mut readings = vec![100.0; 9];
        readings.push(105.0);
        let (_, alerts) = feed(&detector, &readings);
        assert!(alerts[9].is_none());
    }

    #[test]
    fn test_alerts_match_reference_over_long_sequence() {
        let detector = SlidingWindowDetector::default();
        let mut window = VecDeque::new();
        let mut history: Vec<f64> = Vec::new();

        // Deterministic wobble with a spike every 13 readings
        for i in 0..200u32 {
            let wobble = f64::from((i * 7919) % 9) - 4.0;
            let value = if i % 13 == 12 { 100.0 + 6.0 * wobble.signum() + wobble } else { 100.0 + wobble };
            let alert = detector.observe(&mut window, value);
            history.push(value);

            let expected = if history.len() >= 10 {
                let prev = &history[history.len() - 10..history.len() - 1];
                let avg = prev.iter().sum::<f64>() / 9.0;
                (value - avg).abs() > 5.0
            } else {
                false
            };
            assert_eq!(alert.is_some(), expected, "reading #{i} = {value}");
            assert!(window.len() <= 10);
        }
    }

    #[test]
    fn test_non_finite_reading_is_ignored() {
        let detector = SlidingWindowDetector::default();
        let (mut window, _) = feed(&detector, &[100.0; 10]);
        assert!(detector.observe(&mut window, f64::NAN).is_none());
        assert_eq!(window.len(), 10);
        assert!(window.iter().all(|v| *v == 100.0));
    }
}
