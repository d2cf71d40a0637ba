//! Gate that drops frames presented before a cutoff.
//!
//! Container seeks land on a keyframe at or before the requested time, so decoding
//! restarts somewhat early. While enabled, the filter discards everything ahead of
//! the seek target.

use crate::frame::TimeBase;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeFilter {
    enabled: bool,
    min_time: f64,
}

impl TimeFilter {
    pub fn enable(&mut self, min_time: f64) {
        self.enabled = true;
        self.min_time = min_time;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// `true` if a frame at `pts` should be kept.
    pub fn check(&self, pts: i64, time_base: TimeBase) -> bool {
        !self.enabled || time_base.seconds(pts) >= self.min_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TB: TimeBase = TimeBase::new(1, 1000);

    #[test]
    fn disabled_filter_passes_everything() {
        let filter = TimeFilter::default();
        assert!(filter.check(-5, TB));
        assert!(filter.check(0, TB));
    }

    #[test]
    fn enabled_filter_drops_frames_before_cutoff() {
        let mut filter = TimeFilter::default();
        filter.enable(2.0);
        assert!(!filter.check(1_999, TB));
        assert!(filter.check(2_000, TB));
        assert!(filter.check(5_000, TB));

        filter.disable();
        assert!(filter.check(0, TB));
    }
}
