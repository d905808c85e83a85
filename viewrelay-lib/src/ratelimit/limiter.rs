use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use tokio::time::Instant;

use crate::ratelimit::{RateLimitConfig, RateWindow, WindowKind};
use crate::types::ActorId;
use crate::{ErrorKind, Result};

/// Answer of [`RateLimiter::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The cost was charged to every window
    Allowed,
    /// Nothing was charged
    Denied {
        /// Time until the soonest of the actor's windows resets
        retry_after: Duration,
        /// The first window found exhausted
        window: WindowKind,
    },
}

impl Admission {
    /// Whether the request was admitted
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Turn a denial into [`ErrorKind::RateLimitExceeded`]
    ///
    /// # Errors
    ///
    /// Fails if the admission was denied.
    pub fn into_result(self, actor: &ActorId) -> Result<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied { retry_after, .. } => Err(ErrorKind::RateLimitExceeded {
                actor: actor.clone(),
                retry_after,
            }),
        }
    }
}

/// Current counters of one actor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Requests in the current minute window
    pub minute: u32,
    /// Requests in the current hour window
    pub hour: u32,
    /// Requests in the current day window
    pub day: u32,
}

#[derive(Debug)]
struct ActorWindows([RateWindow; 3]);

impl ActorWindows {
    fn new(now: Instant) -> Self {
        Self(WindowKind::ALL.map(|kind| RateWindow::new(kind, now)))
    }

    fn admit(&mut self, cost: u32, config: &RateLimitConfig, now: Instant) -> Admission {
        for window in &mut self.0 {
            window.roll(now);
        }

        let exceeded = self
            .0
            .iter()
            .find(|window| window.would_exceed(cost, config.limit(window.kind())));

        if let Some(exceeded) = exceeded {
            let retry_after = self
                .0
                .iter()
                .map(|window| window.remaining(now))
                .min()
                .unwrap_or_default();
            return Admission::Denied {
                retry_after,
                window: exceeded.kind(),
            };
        }

        for window in &mut self.0 {
            window.charge(cost);
        }
        Admission::Allowed
    }

    fn usage(&self, now: Instant) -> Usage {
        let count = |index: usize| {
            let window = &self.0[index];
            if window.is_elapsed(now) { 0 } else { window.count() }
        };
        Usage {
            minute: count(0),
            hour: count(1),
            day: count(2),
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.0
            .iter()
            .all(|window| window.count() == 0 || window.is_elapsed(now))
    }
}

/// Admits or rejects requests per actor across minute, hour and day windows.
///
/// Every actor gets its own lock, so admissions for one actor are serialized
/// while different actors never wait on each other. The map only guards the
/// lookup of an actor's windows.
#[derive(Debug, Default)]
pub struct RateLimiter {
    actors: DashMap<ActorId, Arc<Mutex<ActorWindows>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter with the given limits
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            actors: DashMap::new(),
            config,
        }
    }

    /// The configured limits
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Charge `cost` to every window of `actor` if all of them have room.
    ///
    /// If any window would be exceeded, nothing is charged and the time until
    /// the soonest window resets is returned.
    pub fn admit(&self, actor: &ActorId, cost: u32) -> Admission {
        let now = Instant::now();
        let windows = self.windows_of(actor, now);
        let admission = windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(cost, &self.config, now);

        if let Admission::Denied {
            retry_after,
            window,
        } = admission
        {
            debug!("Denied actor {actor}: {window} limit reached, retry after {retry_after:?}");
        }
        admission
    }

    /// Current counters of `actor`, if it was seen before
    #[must_use]
    pub fn usage(&self, actor: &ActorId) -> Option<Usage> {
        let windows = self.actors.get(actor).map(|entry| Arc::clone(entry.value()))?;
        let usage = windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usage(Instant::now());
        Some(usage)
    }

    /// Forget actors whose windows are all empty or elapsed.
    ///
    /// Actors whose windows are borrowed by a running admission are kept,
    /// so a charge never lands on windows that were already dropped.
    /// Returns how many actors were dropped.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.actors.len();
        self.actors.retain(|_, windows| {
            Arc::strong_count(windows) > 1
                || !windows
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_idle(now)
        });
        before.saturating_sub(self.actors.len())
    }

    /// Number of actors currently tracked
    #[must_use]
    pub fn tracked_actors(&self) -> usize {
        self.actors.len()
    }

    fn windows_of(&self, actor: &ActorId, now: Instant) -> Arc<Mutex<ActorWindows>> {
        if let Some(windows) = self.actors.get(actor) {
            return Arc::clone(windows.value());
        }
        // Another thread may have inserted the actor in the meantime
        Arc::clone(
            self.actors
                .entry(actor.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ActorWindows::new(now))))
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(per_minute: u32, per_hour: u32, per_day: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            per_minute,
            per_hour,
            per_day,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixteenth_request_in_a_minute_is_denied() {
        let limiter = RateLimiter::default();
        let actor = ActorId::from("alice");

        for _ in 0..15 {
            assert_eq!(limiter.admit(&actor, 1), Admission::Allowed);
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        match limiter.admit(&actor, 1) {
            Admission::Denied {
                retry_after,
                window,
            } => {
                assert_eq!(window, WindowKind::Minute);
                assert!(retry_after <= Duration::from_secs(60));
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            Admission::Allowed => panic!("16th request must be denied"),
        }
        assert_eq!(
            limiter.usage(&actor),
            Some(Usage {
                minute: 15,
                hour: 15,
                day: 15
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_resets() {
        let limiter = limiter(2, 100, 100);
        let actor = ActorId::from("alice");
        assert!(limiter.admit(&actor, 1).is_allowed());
        assert!(limiter.admit(&actor, 1).is_allowed());
        assert!(!limiter.admit(&actor, 1).is_allowed());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.admit(&actor, 1).is_allowed());
        assert_eq!(limiter.usage(&actor).unwrap().hour, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_limit_spans_minute_windows() {
        let limiter = limiter(5, 6, 100);
        let actor = ActorId::from("alice");
        for _ in 0..5 {
            assert!(limiter.admit(&actor, 1).is_allowed());
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.admit(&actor, 1).is_allowed());

        let Admission::Denied {
            retry_after,
            window,
        } = limiter.admit(&actor, 1)
        else {
            panic!("hour limit must deny");
        };
        assert_eq!(window, WindowKind::Hour);
        // The minute window restarted 0s ago and resets first
        assert_eq!(retry_after, Duration::from_secs(60));
    }

    #[test]
    fn test_denial_charges_nothing() {
        let limiter = limiter(3, 100, 100);
        let actor = ActorId::from("alice");
        assert!(limiter.admit(&actor, 2).is_allowed());
        assert!(!limiter.admit(&actor, 2).is_allowed());
        assert_eq!(
            limiter.usage(&actor),
            Some(Usage {
                minute: 2,
                hour: 2,
                day: 2
            })
        );
        assert!(limiter.admit(&actor, 1).is_allowed());
    }

    #[test]
    fn test_actors_are_independent() {
        let limiter = limiter(1, 10, 10);
        let alice = ActorId::from("alice");
        let bob = ActorId::from("bob");
        assert!(limiter.admit(&alice, 1).is_allowed());
        assert!(!limiter.admit(&alice, 1).is_allowed());
        assert!(limiter.admit(&bob, 1).is_allowed());
        assert_eq!(limiter.tracked_actors(), 2);
    }

    #[test]
    fn test_denial_into_error() {
        let actor = ActorId::from("alice");
        let denied = Admission::Denied {
            retry_after: Duration::from_secs(5),
            window: WindowKind::Day,
        };
        assert!(matches!(
            denied.into_result(&actor),
            Err(ErrorKind::RateLimitExceeded { retry_after, .. }) if retry_after == Duration::from_secs(5)
        ));
        assert!(Admission::Allowed.into_result(&actor).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_actors() {
        let limiter = RateLimiter::default();
        limiter.admit(&ActorId::from("alice"), 1);
        tokio::time::advance(Duration::from_secs(3600)).await;
        limiter.admit(&ActorId::from("bob"), 1);

        assert_eq!(limiter.prune_idle(), 0);
        tokio::time::advance(Duration::from_secs(23 * 3600)).await;
        assert_eq!(limiter.prune_idle(), 1);
        assert!(limiter.usage(&ActorId::from("alice")).is_none());
        assert!(limiter.usage(&ActorId::from("bob")).is_some());
    }

    #[test]
    fn test_prune_keeps_actor_with_admission_in_progress() {
        let limiter = limiter(1, 10, 10);
        let actor = ActorId::from("alice");

        // An admission has looked up the fresh windows but not charged yet
        let held = limiter.windows_of(&actor, Instant::now());
        assert_eq!(limiter.prune_idle(), 0);
        assert_eq!(limiter.tracked_actors(), 1);

        let admission = held
            .lock()
            .unwrap()
            .admit(1, limiter.config(), Instant::now());
        assert!(admission.is_allowed());
        drop(held);

        assert_eq!(limiter.usage(&actor).unwrap().minute, 1);
        assert!(!limiter.admit(&actor, 1).is_allowed());
        assert_eq!(limiter.prune_idle(), 0);
    }

    #[test]
    fn test_prune_drops_untouched_actor() {
        let limiter = RateLimiter::default();
        let actor = ActorId::from("alice");
        drop(limiter.windows_of(&actor, Instant::now()));

        assert_eq!(limiter.prune_idle(), 1);
        assert_eq!(limiter.tracked_actors(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(limiter(15, 150, 1000));
        let allowed = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                tokio::spawn(async move {
                    if limiter.admit(&ActorId::from("alice"), 1).is_allowed() {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 15);
        assert_eq!(limiter.usage(&ActorId::from("alice")).unwrap().minute, 15);
    }
}
