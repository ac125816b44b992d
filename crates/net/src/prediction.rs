//! Client-side prediction and server reconciliation.
//!
//! Only the locally controlled entity is predicted. Every predicted position
//! is logged by client tick; when the authoritative position for a tick
//! arrives it is compared against the log and either accepted silently or
//! turned into a snap.

use glam::Vec2;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of predicted ticks kept (~2 s at 60 Hz).
pub const DEFAULT_PREDICTION_CAPACITY: usize = 120;

/// Outcome of a reconciliation that requires a correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Whether the client must snap to `position`.
    pub snap: bool,
    /// Authoritative position.
    pub position: Vec2,
}

/// Metrics for tracking prediction accuracy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionMetrics {
    /// Total number of predictions recorded.
    pub total_predictions: u64,

    /// Reconciliations that matched within tolerance.
    pub total_matches: u64,

    /// Reconciliations that ended in a snap.
    pub total_snaps: u64,

    /// Snaps caused by a tick with no recorded prediction.
    pub unknown_ticks: u64,

    /// Largest error seen on a mismatch (in tiles).
    pub max_error_distance: f32,
}

#[derive(Debug)]
struct Log {
    predictions: BTreeMap<u64, Vec2>,
    capacity: usize,
    metrics: PredictionMetrics,
}

/// Bounded tick → predicted position log with reconciliation.
///
/// Written from the input path and reconciled from the network path, so the
/// log sits behind a mutex.
#[derive(Debug)]
pub struct PredictionLog {
    inner: Mutex<Log>,
}

impl Default for PredictionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionLog {
    /// Create a log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PREDICTION_CAPACITY)
    }

    /// Create a log keeping at most `capacity` ticks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Log {
                predictions: BTreeMap::new(),
                capacity: capacity.max(1),
                metrics: PredictionMetrics::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the predicted position for `tick`, evicting the oldest ticks
    /// once the log is over capacity.
    pub fn record_prediction(&self, tick: u64, position: Vec2) {
        let mut log = self.lock();
        log.predictions.insert(tick, position);
        log.metrics.total_predictions += 1;
        while log.predictions.len() > log.capacity {
            log.predictions.pop_first();
        }
    }

    /// Compare the authoritative position for `server_tick` with the log.
    ///
    /// Returns `None` when the prediction was within `tolerance`; the entry is
    /// kept. Otherwise returns a snap to `server_position`. A mismatch also
    /// discards every prediction at or before `server_tick`.
    pub fn reconcile(
        &self,
        server_tick: u64,
        server_position: Vec2,
        tolerance: f32,
    ) -> Option<Reconciliation> {
        let mut log = self.lock();
        let snap = Reconciliation {
            snap: true,
            position: server_position,
        };

        let Some(predicted) = log.predictions.get(&server_tick).copied() else {
            log.metrics.unknown_ticks += 1;
            log.metrics.total_snaps += 1;
            return Some(snap);
        };

        let error_sq = predicted.distance_squared(server_position);
        if error_sq > tolerance * tolerance {
            log.predictions.retain(|tick, _| *tick > server_tick);
            log.metrics.total_snaps += 1;
            let error = error_sq.sqrt();
            if error > log.metrics.max_error_distance {
                log.metrics.max_error_distance = error;
            }
            Some(snap)
        } else {
            log.metrics.total_matches += 1;
            None
        }
    }

    /// Predicted position for `tick`, if still logged.
    pub fn predicted(&self, tick: u64) -> Option<Vec2> {
        self.lock().predictions.get(&tick).copied()
    }

    /// Newest logged tick.
    pub fn latest_tick(&self) -> Option<u64> {
        self.lock().predictions.last_key_value().map(|(tick, _)| *tick)
    }

    /// Number of logged ticks.
    pub fn len(&self) -> usize {
        self.lock().predictions.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current metrics.
    pub fn metrics(&self) -> PredictionMetrics {
        self.lock().metrics.clone()
    }

    /// Forget every prediction (metrics are kept).
    pub fn clear(&self) {
        self.lock().predictions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_prediction_needs_no_correction() {
        let log = PredictionLog::new();
        log.record_prediction(100, Vec2::new(5.0, 5.0));

        assert_eq!(log.reconcile(100, Vec2::new(5.0, 5.0), 0.01), None);
        // Entry survives a match.
        assert_eq!(log.predicted(100), Some(Vec2::new(5.0, 5.0)));
        assert_eq!(log.metrics().total_matches, 1);
    }

    #[test]
    fn diverged_prediction_snaps() {
        let log = PredictionLog::new();
        log.record_prediction(100, Vec2::new(5.0, 5.0));

        let result = log.reconcile(100, Vec2::new(5.0, 5.5), 0.01);
        assert_eq!(
            result,
            Some(Reconciliation {
                snap: true,
                position: Vec2::new(5.0, 5.5)
            })
        );
        let metrics = log.metrics();
        assert_eq!(metrics.total_snaps, 1);
        assert!((metrics.max_error_distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn unknown_tick_always_snaps() {
        let log = PredictionLog::new();
        log.record_prediction(1, Vec2::ZERO);

        let result = log.reconcile(999, Vec2::ZERO, 10.0);
        assert_eq!(
            result,
            Some(Reconciliation {
                snap: true,
                position: Vec2::ZERO
            })
        );
        assert_eq!(log.metrics().unknown_ticks, 1);
        // Nothing is discarded for an unknown tick.
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn mismatch_discards_resolved_ticks() {
        let log = PredictionLog::new();
        for tick in 1..=5 {
            log.record_prediction(tick, Vec2::new(tick as f32, 0.0));
        }

        log.reconcile(3, Vec2::new(100.0, 0.0), 0.1);

        assert_eq!(log.predicted(1), None);
        assert_eq!(log.predicted(3), None);
        assert_eq!(log.predicted(4), Some(Vec2::new(4.0, 0.0)));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn tolerance_boundary_is_inclusive() {
        let log = PredictionLog::new();
        log.record_prediction(7, Vec2::ZERO);
        assert_eq!(log.reconcile(7, Vec2::new(0.5, 0.0), 0.5), None);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = PredictionLog::with_capacity(3);
        for tick in 10..15 {
            log.record_prediction(tick, Vec2::ZERO);
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.predicted(11), None);
        assert_eq!(log.predicted(12), Some(Vec2::ZERO));
        assert_eq!(log.latest_tick(), Some(14));
        assert_eq!(log.metrics().total_predictions, 5);
    }

    #[test]
    fn default_capacity_bounds_memory() {
        let log = PredictionLog::new();
        for tick in 0..1_000 {
            log.record_prediction(tick, Vec2::ZERO);
        }
        assert_eq!(log.len(), DEFAULT_PREDICTION_CAPACITY);
    }

    #[test]
    fn clear_keeps_metrics() {
        let log = PredictionLog::new();
        log.record_prediction(1, Vec2::ZERO);
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.metrics().total_predictions, 1);
    }
}
