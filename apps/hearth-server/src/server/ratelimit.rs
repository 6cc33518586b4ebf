use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_started_at: Instant,
    cooldown_until: Option<Instant>,
}

/// Two-phase sliding-window rate limiter: a counting window followed by a
/// strictly enforced cooldown once the window's limit is exceeded. One
/// instance per protected surface; keys are caller-chosen (client IP for
/// login, user id for messages).
///
/// All critical sections are O(1) map operations under a single mutex. A
/// background sweep prunes keys whose window and cooldown have both lapsed
/// so high key cardinality cannot grow memory without bound; call
/// [`SlidingWindowLimiter::close`] to stop it when the limiter is discarded.
pub(crate) struct SlidingWindowLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    max_events: u32,
    window: Duration,
    cooldown: Duration,
    stop_tx: watch::Sender<bool>,
}

impl SlidingWindowLimiter {
    fn new(max_events: u32, window: Duration, cooldown: Duration) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_events,
            window,
            cooldown,
            stop_tx,
        }
    }

    /// Build the limiter and spawn its sweep task. Must run inside a tokio
    /// runtime.
    pub(crate) fn start(
        max_events: u32,
        window: Duration,
        cooldown: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let limiter = Arc::new(Self::new(max_events, window, cooldown));
        let sweeper = Arc::clone(&limiter);
        let mut stop_rx = limiter.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.sweep(Instant::now()),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        limiter
    }

    pub(crate) fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(bucket) = buckets.get_mut(key) else {
            buckets.insert(
                key.to_owned(),
                Bucket {
                    count: 1,
                    window_started_at: now,
                    cooldown_until: None,
                },
            );
            return true;
        };

        if let Some(cooldown_until) = bucket.cooldown_until {
            if now < cooldown_until {
                return false;
            }
            // Cooldown served; start over with a fresh window.
            bucket.count = 1;
            bucket.window_started_at = now;
            bucket.cooldown_until = None;
            return true;
        }

        if now.duration_since(bucket.window_started_at) > self.window {
            bucket.count = 1;
            bucket.window_started_at = now;
            return true;
        }

        bucket.count += 1;
        if bucket.count > self.max_events {
            bucket.cooldown_until = Some(now + self.cooldown);
            return false;
        }
        true
    }

    /// Clear all state for a key. Called after a successful login so a
    /// legitimate user is not punished for earlier failed attempts.
    pub(crate) fn reset(&self, key: &str) {
        let mut buckets = self.buckets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets.remove(key);
    }

    /// Whole seconds of cooldown remaining, rounded up; zero when none.
    pub(crate) fn remaining_cooldown_secs(&self, key: &str) -> u64 {
        self.remaining_cooldown_secs_at(key, Instant::now())
    }

    fn remaining_cooldown_secs_at(&self, key: &str, now: Instant) -> u64 {
        let buckets = self.buckets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(bucket) = buckets.get(key) else {
            return 0;
        };
        let Some(cooldown_until) = bucket.cooldown_until else {
            return 0;
        };
        if cooldown_until <= now {
            return 0;
        }
        let remaining = cooldown_until.duration_since(now);
        let mut seconds = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            seconds += 1;
        }
        seconds
    }

    /// Stop the background sweep task.
    pub(crate) fn close(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn sweep(&self, now: Instant) {
        let mut buckets = self.buckets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets.retain(|_, bucket| {
            let window_live = now.duration_since(bucket.window_started_at) <= self.window;
            let cooldown_live = bucket
                .cooldown_until
                .is_some_and(|cooldown_until| cooldown_until > now);
            window_live || cooldown_live
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::SlidingWindowLimiter;

    fn limiter(max: u32, window_secs: u64, cooldown_secs: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            max,
            Duration::from_secs(window_secs),
            Duration::from_secs(cooldown_secs),
        )
    }

    #[test]
    fn five_in_window_pass_then_cooldown_enforced_until_fresh_window() {
        let limiter = limiter(5, 5, 15);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("user-1", start));
        }
        assert!(!limiter.allow_at("user-1", start));

        // Inside the cooldown nothing passes, even after the window lapses.
        assert!(!limiter.allow_at("user-1", start + Duration::from_secs(6)));
        assert!(!limiter.allow_at("user-1", start + Duration::from_secs(14)));

        // Cooldown served; a fresh window starts.
        assert!(limiter.allow_at("user-1", start + Duration::from_secs(16)));
        for _ in 0..4 {
            assert!(limiter.allow_at("user-1", start + Duration::from_secs(16)));
        }
        assert!(!limiter.allow_at("user-1", start + Duration::from_secs(16)));
    }

    #[test]
    fn window_expiry_starts_a_fresh_count() {
        let limiter = limiter(5, 120, 300);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("203.0.113.9", start));
        }
        let later = start + Duration::from_secs(121);
        for _ in 0..5 {
            assert!(limiter.allow_at("203.0.113.9", later));
        }
        assert!(!limiter.allow_at("203.0.113.9", later));
    }

    #[test]
    fn reset_clears_state_immediately() {
        let limiter = limiter(5, 120, 300);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("203.0.113.7", start));
        }
        assert!(!limiter.allow_at("203.0.113.7", start));

        limiter.reset("203.0.113.7");
        assert!(limiter.allow_at("203.0.113.7", start));
    }

    #[test]
    fn remaining_cooldown_rounds_up_and_expires() {
        let limiter = limiter(1, 5, 15);
        let start = Instant::now();

        assert!(limiter.allow_at("user-2", start));
        assert!(!limiter.allow_at("user-2", start));

        assert_eq!(limiter.remaining_cooldown_secs_at("user-2", start), 15);
        assert_eq!(
            limiter.remaining_cooldown_secs_at(
                "user-2",
                start + Duration::from_millis(10_500)
            ),
            5
        );
        assert_eq!(
            limiter.remaining_cooldown_secs_at("user-2", start + Duration::from_secs(15)),
            0
        );
        assert_eq!(limiter.remaining_cooldown_secs_at("missing", start), 0);
    }

    #[test]
    fn keys_are_tracked_independently() {
        let limiter = limiter(1, 5, 15);
        let start = Instant::now();

        assert!(limiter.allow_at("a", start));
        assert!(!limiter.allow_at("a", start));
        assert!(limiter.allow_at("b", start));
    }

    #[test]
    fn sweep_prunes_only_fully_lapsed_keys() {
        let limiter = limiter(1, 5, 15);
        let start = Instant::now();

        assert!(limiter.allow_at("idle", start));
        assert!(limiter.allow_at("cooling", start));
        assert!(!limiter.allow_at("cooling", start));
        assert_eq!(limiter.bucket_count(), 2);

        // Window lapsed for both, but "cooling" still serves its cooldown.
        limiter.sweep(start + Duration::from_secs(10));
        assert_eq!(limiter.bucket_count(), 1);
        assert!(!limiter.allow_at("cooling", start + Duration::from_secs(10)));

        limiter.sweep(start + Duration::from_secs(30));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn background_sweep_runs_and_stops_on_close() {
        let limiter = SlidingWindowLimiter::start(
            1,
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        assert!(limiter.allow("ephemeral"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(limiter.bucket_count(), 0);
        limiter.close();
    }
}
