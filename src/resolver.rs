use crate::telemetry::TelemetrySample;
use std::sync::Arc;

/// Immutable, cheaply clonable view of a ring buffer at one instant.
///
/// Entries keep buffer insertion order. Lookups assume that order is
/// non-decreasing by frame index and never re-sort.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    samples: Arc<[Arc<TelemetrySample>]>,
}

impl FrameSnapshot {
    pub fn from_samples(samples: Vec<Arc<TelemetrySample>>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TelemetrySample>> {
        self.samples.iter()
    }

    /// Frame indices of the first and last entries
    pub fn frame_range(&self) -> Option<(u64, u64)> {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some((first.frame_index, last.frame_index)),
            _ => None,
        }
    }

    /// Sample closest to `target_frame`; see [`resolve_nearest`]
    pub fn resolve(&self, target_frame: u64) -> Option<Arc<TelemetrySample>> {
        resolve_nearest(&self.samples, target_frame).cloned()
    }
}

/// Find the sample whose frame index is closest to `target_frame`.
///
/// Binary search for the first entry at or past the target, then compare it
/// with its predecessor. Ties go to the predecessor, the frame already
/// elapsed. Targets outside the buffered range clamp to the first or last
/// entry. Returns `None` only for an empty slice.
pub fn resolve_nearest(
    samples: &[Arc<TelemetrySample>],
    target_frame: u64,
) -> Option<&Arc<TelemetrySample>> {
    if samples.is_empty() {
        return None;
    }

    let index = samples.partition_point(|s| s.frame_index < target_frame);

    if index == samples.len() {
        return samples.last();
    }
    if index == 0 {
        return samples.first();
    }

    let previous = &samples[index - 1];
    let candidate = &samples[index];
    let previous_distance = target_frame.abs_diff(previous.frame_index);
    let candidate_distance = target_frame.abs_diff(candidate.frame_index);

    if previous_distance <= candidate_distance {
        Some(previous)
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(frames: &[u64]) -> FrameSnapshot {
        FrameSnapshot::from_samples(
            frames
                .iter()
                .map(|&f| Arc::new(TelemetrySample::new("cam-1", f)))
                .collect(),
        )
    }

    fn resolved(snapshot: &FrameSnapshot, target: u64) -> Option<u64> {
        snapshot.resolve(target).map(|s| s.frame_index)
    }

    #[test]
    fn test_nearest_match() {
        let snapshot = snapshot_of(&[10, 20, 30]);

        assert_eq!(resolved(&snapshot, 24), Some(20));
        assert_eq!(resolved(&snapshot, 26), Some(30));
        assert_eq!(resolved(&snapshot, 20), Some(20));
    }

    #[test]
    fn test_midpoint_prefers_lower_index() {
        let snapshot = snapshot_of(&[10, 20, 30]);
        assert_eq!(resolved(&snapshot, 25), Some(20));
        assert_eq!(resolved(&snapshot, 15), Some(10));
    }

    #[test]
    fn test_out_of_range_clamps() {
        let snapshot = snapshot_of(&[10, 20, 30]);
        assert_eq!(resolved(&snapshot, 5), Some(10));
        assert_eq!(resolved(&snapshot, 0), Some(10));
        assert_eq!(resolved(&snapshot, 999), Some(30));
    }

    #[test]
    fn test_empty_snapshot_has_no_match() {
        let snapshot = FrameSnapshot::default();
        assert!(snapshot.resolve(0).is_none());
        assert!(snapshot.resolve(u64::MAX).is_none());
        assert!(snapshot.frame_range().is_none());
    }

    #[test]
    fn test_single_entry() {
        let snapshot = snapshot_of(&[42]);
        assert_eq!(resolved(&snapshot, 0), Some(42));
        assert_eq!(resolved(&snapshot, 42), Some(42));
        assert_eq!(resolved(&snapshot, 1000), Some(42));
    }

    #[test]
    fn test_gaps_and_duplicates() {
        let snapshot = snapshot_of(&[0, 5, 5, 100]);
        assert_eq!(resolved(&snapshot, 5), Some(5));
        assert_eq!(resolved(&snapshot, 52), Some(5));
        assert_eq!(resolved(&snapshot, 53), Some(100));
        assert_eq!(snapshot.frame_range(), Some((0, 100)));
    }

    #[test]
    fn test_out_of_order_entry_still_returns_a_sample() {
        // Ordering violated by a late arrival; the lookup must not panic and
        // must return some buffered entry.
        let snapshot = snapshot_of(&[10, 20, 15, 30]);
        for target in [0, 12, 17, 22, 40] {
            assert!(snapshot.resolve(target).is_some());
        }
    }
}
