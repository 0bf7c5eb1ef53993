use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Deepest split level the predictor keeps separate statistics for.
const MAX_LEVELS: usize = 32;

/// Exponential smoothing factor: each new sample contributes 1/4 of the
/// estimate, the history the remaining 3/4.
const SMOOTHING_SHIFT: u32 = 2;

/// Per-depth runtime statistics of one worker.
///
/// Estimates are exponentially-weighted moving averages of observed leaf
/// runtimes, stored as nanoseconds. A depth without samples borrows the
/// nearest shallower estimate, halved once per level of distance, matching
/// the assumption that a split halves the work.
///
/// Samples may be registered from a foreign thread (a producer inlining a
/// task on a full queue runs it against the target worker's predictor), so
/// the slots are atomics; a lost update under contention only delays the
/// estimate by one sample.
pub(crate) struct RuntimePredictor {
    samples: [AtomicU64; MAX_LEVELS],
}

impl RuntimePredictor {
    pub(crate) fn new() -> Self {
        RuntimePredictor {
            samples: [const { AtomicU64::new(0) }; MAX_LEVELS],
        }
    }

    /// Folds an observed runtime at `depth` into the estimate.
    pub(crate) fn register_time(&self, depth: usize, elapsed: Duration) {
        let slot = &self.samples[depth.min(MAX_LEVELS - 1)];
        // a sample of zero would read as "unmeasured"
        let nanos = (elapsed.as_nanos() as u64).max(1);

        let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
            if old == 0 {
                Some(nanos)
            } else {
                Some(old - (old >> SMOOTHING_SHIFT) + (nanos >> SMOOTHING_SHIFT))
            }
        });
    }

    /// Estimated runtime of a task at `depth`. Zero means no basis for a
    /// prediction exists yet.
    pub(crate) fn predict_time(&self, depth: usize) -> Duration {
        let depth = depth.min(MAX_LEVELS - 1);
        for level in (0..=depth).rev() {
            let nanos = self.samples[level].load(Ordering::Acquire);
            if nanos != 0 {
                return Duration::from_nanos(nanos >> (depth - level) as u32);
            }
        }
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmeasured_predicts_zero() {
        let predictor = RuntimePredictor::new();
        assert_eq!(predictor.predict_time(0), Duration::ZERO);
        assert_eq!(predictor.predict_time(10), Duration::ZERO);
    }

    #[test]
    fn test_first_sample_is_taken_verbatim() {
        let predictor = RuntimePredictor::new();
        predictor.register_time(3, Duration::from_micros(100));
        assert_eq!(predictor.predict_time(3), Duration::from_micros(100));
    }

    #[test]
    fn test_estimates_smooth_towards_new_samples() {
        let predictor = RuntimePredictor::new();
        predictor.register_time(2, Duration::from_nanos(1000));
        predictor.register_time(2, Duration::from_nanos(2000));
        // 1000 - 250 + 500
        assert_eq!(predictor.predict_time(2), Duration::from_nanos(1250));
    }

    #[test]
    fn test_deeper_levels_borrow_halved_estimates() {
        let predictor = RuntimePredictor::new();
        predictor.register_time(4, Duration::from_nanos(4096));
        assert_eq!(predictor.predict_time(5), Duration::from_nanos(2048));
        assert_eq!(predictor.predict_time(7), Duration::from_nanos(512));
        // shallower levels do not extrapolate upwards
        assert_eq!(predictor.predict_time(3), Duration::ZERO);
    }

    #[test]
    fn test_depths_beyond_the_table_share_the_last_slot() {
        let predictor = RuntimePredictor::new();
        predictor.register_time(MAX_LEVELS + 10, Duration::from_nanos(777));
        assert_eq!(
            predictor.predict_time(MAX_LEVELS * 2),
            Duration::from_nanos(777)
        );
    }
}
