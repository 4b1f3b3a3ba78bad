//! Per-sink activation and volume tracking.
//!
//! A sink is *activated* while it is the server's default sink or has at
//! least one sink input routed to it. Both trackers report edges only, so
//! callers can forward every returned value as an event without extra
//! comparison.

/// Derives the activation flag from default-sink and sink-input state.
#[derive(Debug, Default)]
pub(crate) struct ActivationTracker {
    is_default: bool,
    input_count: u32,
    activated: bool,
}

impl ActivationTracker {
    /// Updates the default-sink flag. Returns the new activation value on an
    /// edge.
    pub fn set_default(&mut self, is_default: bool) -> Option<bool> {
        self.is_default = is_default;
        self.edge()
    }

    /// Updates the routed sink-input count. Returns the new activation value
    /// on an edge.
    pub fn set_input_count(&mut self, count: u32) -> Option<bool> {
        self.input_count = count;
        self.edge()
    }

    /// Current activation value.
    pub fn activated(&self) -> bool {
        self.activated
    }

    fn edge(&mut self) -> Option<bool> {
        let now = self.is_default || self.input_count > 0;
        if now == self.activated {
            None
        } else {
            self.activated = now;
            Some(now)
        }
    }
}

/// Deduplicates (left, right, muted) volume reports.
#[derive(Debug, Default)]
pub(crate) struct VolumeTracker {
    current: Option<(f64, f64, bool)>,
}

impl VolumeTracker {
    /// Records a volume report. Returns it back when it differs from the
    /// previous one.
    pub fn update(&mut self, left: f64, right: f64, muted: bool) -> Option<(f64, f64, bool)> {
        let next = (left, right, muted);
        if self.current == Some(next) {
            None
        } else {
            self.current = Some(next);
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_follows_default_and_inputs() {
        let mut tracker = ActivationTracker::default();
        assert!(!tracker.activated());

        // No default change, no inputs: stays off.
        assert_eq!(tracker.set_input_count(0), None);
        assert_eq!(tracker.set_default(false), None);

        // Becoming the default sink activates.
        assert_eq!(tracker.set_default(true), Some(true));
        assert!(tracker.activated());

        // Inputs arriving while already active: no edge.
        assert_eq!(tracker.set_input_count(2), None);

        // Losing default while inputs remain: still active.
        assert_eq!(tracker.set_default(false), None);

        // Last input gone: deactivates.
        assert_eq!(tracker.set_input_count(0), Some(false));
        assert!(!tracker.activated());
    }

    #[test]
    fn default_toggle_with_zero_inputs() {
        let mut tracker = ActivationTracker::default();
        assert_eq!(tracker.set_default(true), Some(true));
        assert_eq!(tracker.set_default(false), Some(false));
    }

    #[test]
    fn volume_fires_only_on_change() {
        let mut tracker = VolumeTracker::default();
        assert_eq!(tracker.update(1.0, 1.0, false), Some((1.0, 1.0, false)));
        assert_eq!(tracker.update(1.0, 1.0, false), None);
        assert_eq!(tracker.update(1.0, 1.0, true), Some((1.0, 1.0, true)));
        assert_eq!(tracker.update(0.5, 1.0, true), Some((0.5, 1.0, true)));
    }
}
