use std::time::Duration;

use strum::Display;
use tokio::time::Instant;

/// Length of a fixed counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum WindowKind {
    /// 60 seconds
    Minute,
    /// 60 minutes
    Hour,
    /// 24 hours
    Day,
}

impl WindowKind {
    /// All window kinds, shortest first
    pub const ALL: [WindowKind; 3] = [WindowKind::Minute, WindowKind::Hour, WindowKind::Day];

    /// How long one window lasts
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            WindowKind::Minute => Duration::from_secs(60),
            WindowKind::Hour => Duration::from_secs(60 * 60),
            WindowKind::Day => Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Usage counter for one window kind of one actor.
///
/// Windows are fixed, not sliding: the counter starts at the first request
/// after a reset and drops to zero at once when the window has elapsed. An
/// actor can therefore spend a full limit right before and right after a
/// boundary.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    kind: WindowKind,
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    /// Create an empty window starting at `now`
    #[must_use]
    pub const fn new(kind: WindowKind, now: Instant) -> Self {
        Self {
            kind,
            count: 0,
            window_start: now,
        }
    }

    /// Which window this is
    #[must_use]
    pub const fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Requests counted in the current window
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Start of the current window
    #[must_use]
    pub const fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Whether the window has run its full length at `now`
    #[must_use]
    pub fn is_elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= self.kind.duration()
    }

    /// Time left until the window resets
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        (self.window_start + self.kind.duration()).saturating_duration_since(now)
    }

    /// Start a new window if the current one has elapsed
    pub(crate) fn roll(&mut self, now: Instant) {
        if self.is_elapsed(now) {
            self.count = 0;
            self.window_start = now;
        }
    }

    pub(crate) const fn would_exceed(&self, cost: u32, limit: u32) -> bool {
        self.count.saturating_add(cost) > limit
    }

    pub(crate) const fn charge(&mut self, cost: u32) {
        self.count = self.count.saturating_add(cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_its_duration() {
        let mut window = RateWindow::new(WindowKind::Minute, Instant::now());
        window.charge(10);
        assert_eq!(window.remaining(Instant::now()), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        window.roll(Instant::now());
        assert_eq!(window.count(), 10);
        assert_eq!(window.remaining(Instant::now()), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        window.roll(Instant::now());
        assert_eq!(window.count(), 0);
        assert_eq!(window.window_start(), Instant::now());
    }

    #[test]
    fn test_would_exceed() {
        let mut window = RateWindow::new(WindowKind::Hour, Instant::now());
        window.charge(14);
        assert!(!window.would_exceed(1, 15));
        assert!(window.would_exceed(2, 15));
    }
}
