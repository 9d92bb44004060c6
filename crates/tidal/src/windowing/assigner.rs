use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Event time windows, all times in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Tumbling { size: u64 },
    Sliding { size: u64, slide: u64 },
}

impl WindowType {
    pub const fn size(&self) -> u64 {
        match *self {
            Self::Tumbling { size } | Self::Sliding { size, .. } => size,
        }
    }

    pub const fn slide(&self) -> u64 {
        match *self {
            Self::Tumbling { size } => size,
            Self::Sliding { slide, .. } => slide,
        }
    }

    pub const fn is_valid(&self) -> bool {
        let (size, slide) = (self.size(), self.slide());
        size > 0 && slide > 0 && slide <= size
    }
}

impl Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tumbling { size } => write!(f, "tumbling({size}ms)"),
            Self::Sliding { size, slide } => write!(f, "sliding({size}ms, {slide}ms)"),
        }
    }
}

/// Cuts the time line into slices, the largest intervals that never
/// straddle the start or end of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: u64,
    slide: u64,
}

impl SliceAssigner {
    pub const fn new(window: WindowType) -> Self {
        Self {
            size: window.size(),
            slide: window.slide(),
        }
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn slide(&self) -> u64 {
        self.slide
    }

    pub const fn slice_start(&self, ts: u64) -> u64 {
        let last_window_start = ts - ts % self.slide;
        if ts < self.size {
            return last_window_start;
        }
        let last_window_end = ts - (ts - self.size) % self.slide;
        if last_window_start > last_window_end {
            last_window_start
        } else {
            last_window_end
        }
    }

    pub const fn slice_end(&self, ts: u64) -> u64 {
        let next_window_start = (ts - ts % self.slide).saturating_add(self.slide);
        let next_window_end = if ts < self.size {
            self.size
        } else {
            (ts - (ts - self.size) % self.slide).saturating_add(self.slide)
        };
        if next_window_start < next_window_end {
            next_window_start
        } else {
            next_window_end
        }
    }

    /// `[start, end)` of the slice holding `ts`.
    pub const fn slice(&self, ts: u64) -> (u64, u64) {
        (self.slice_start(ts), self.slice_end(ts))
    }

    /// Every window covering the slice `[start, end)`, ordered by start.
    pub fn windows_of(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, u64)> {
        let (size, slide) = (self.size, self.slide);
        let first = end.saturating_sub(size).div_ceil(slide) * slide;
        let last = start - start % slide;
        (first..=last)
            .step_by(slide as usize)
            .map(move |window_start| (window_start, window_start.saturating_add(size)))
    }

    /// End of the last window covering the slice starting at `start`. Once
    /// the watermark passes it the slice is no longer needed.
    pub const fn last_window_end(&self, start: u64) -> u64 {
        (start - start % self.slide).saturating_add(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn tumbling_slices_are_windows() {
        let assigner = SliceAssigner::new(WindowType::Tumbling { size: 1000 });
        assert_eq!(assigner.slice(0), (0, 1000));
        assert_eq!(assigner.slice(999), (0, 1000));
        assert_eq!(assigner.slice(1000), (1000, 2000));
        assert_eq!(
            assigner.windows_of(1000, 2000).collect::<Vec<_>>(),
            vec![(1000, 2000)]
        );
    }

    #[test]
    fn sliding_slices() {
        // Windows [0,10), [4,14), [8,18), ...
        let assigner = SliceAssigner::new(WindowType::Sliding { size: 10, slide: 4 });
        assert_eq!(assigner.slice(3), (0, 4));
        assert_eq!(assigner.slice(9), (8, 10));
        assert_eq!(assigner.slice(10), (10, 12));
        assert_eq!(assigner.slice(13), (12, 14));
        assert_eq!(
            assigner.windows_of(8, 10).collect::<Vec<_>>(),
            vec![(0, 10), (4, 14), (8, 18)]
        );
        assert_eq!(
            assigner.windows_of(10, 12).collect::<Vec<_>>(),
            vec![(4, 14), (8, 18)]
        );
        assert_eq!(assigner.last_window_end(10), 18);
    }

    proptest! {
        #[test]
        fn slices_fit_inside_their_windows(
            size in 1u64..200,
            slide_fraction in 1u64..=100,
            ts in 0u64..10_000,
        ) {
            let slide = (size * slide_fraction / 100).max(1);
            let assigner = SliceAssigner::new(WindowType::Sliding { size, slide });
            let (start, end) = assigner.slice(ts);
            prop_assert!(start <= ts && ts < end);

            // The slice is covered entirely by every window containing `ts`
            let expected: Vec<_> = (0..=ts / slide)
                .map(|k| (k * slide, k * slide + size))
                .filter(|&(window_start, window_end)| window_start <= ts && ts < window_end)
                .collect();
            prop_assert_eq!(assigner.windows_of(start, end).collect::<Vec<_>>(), expected);

            // Neighbouring timestamps share the slice or border it exactly
            if start > 0 {
                let (_, previous_end) = assigner.slice(start - 1);
                prop_assert_eq!(previous_end, start);
            }
        }
    }
}
