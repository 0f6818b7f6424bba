//! Composition time and frame indexing.

/// Guards `floor(t · fps)` against values like 2.9999999999 for frame 3.
const FRAME_EPSILON: f64 = 1e-9;

/// Frame index of `time_secs` at `frame_rate`, `None` before zero.
pub fn frame_index(time_secs: f64, frame_rate: f64) -> Option<u64> {
    if !(time_secs >= 0.0) || !(frame_rate > 0.0) {
        return None;
    }
    Some((time_secs * frame_rate + FRAME_EPSILON).floor() as u64)
}

/// A point on the composition timeline together with its nominal frame rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositionTime {
    pub seconds: f64,
    pub frame_rate: f64,
}

impl CompositionTime {
    pub fn new(seconds: f64, frame_rate: f64) -> Self {
        Self {
            seconds,
            frame_rate,
        }
    }

    /// Time of frame `index`.
    pub fn of_frame(index: u64, frame_rate: f64) -> Self {
        Self::new(index as f64 / frame_rate, frame_rate)
    }

    pub fn frame(&self) -> Option<u64> {
        frame_index(self.seconds, self.frame_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_index_at_30fps() {
        assert_eq!(frame_index(0.0, 30.0), Some(0));
        assert_eq!(frame_index(0.5, 30.0), Some(15));
        assert_eq!(frame_index(2.5, 30.0), Some(75));
        assert_eq!(frame_index(0.1, 30.0), Some(3));
    }

    #[test]
    fn test_negative_time_has_no_frame() {
        assert_eq!(frame_index(-0.01, 30.0), None);
        assert_eq!(frame_index(f64::NAN, 30.0), None);
    }

    #[test]
    fn test_of_frame_round_trips() {
        for i in [0u64, 1, 29, 30, 68, 152, 240, 9_999] {
            assert_eq!(CompositionTime::of_frame(i, 30.0).frame(), Some(i));
        }
    }
}
