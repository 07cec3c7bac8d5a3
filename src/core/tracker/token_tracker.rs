use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::config::TimeUnit;

type Key = (String, String);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    ts: i64,
    weight: f64,
}

#[derive(Debug, Default)]
struct Window {
    buckets: VecDeque<Bucket>,
    total: f64,
}

/// Sliding-window per-(user, model) weighted token accumulator with O(1)
/// amortized pruning and an ordered index over current totals for O(log n)
/// min/max lookups.
pub struct TokenTracker {
    window: Duration,
    unit: TimeUnit,
    input_weight: f64,
    output_weight: f64,
    windows: RwLock<HashMap<Key, Window>>,
    /// `total.to_bits() → {(user, model)}`, holding only entries with a
    /// strictly positive total. IEEE-754 bit patterns of non-negative
    /// finite floats preserve numeric ordering, so a `BTreeMap` over them
    /// gives exact min/max without floating-point `Ord` gymnastics.
    totals_index: RwLock<BTreeMap<u64, HashSet<Key>>>,
}

/// Sentinel returned by `min`/`max` when no `(user, model)` pair currently
/// has a positive total.
pub const NO_TRACKED_TOKENS: f64 = 0.0;

impl TokenTracker {
    pub fn new(window_amount: u64, unit: TimeUnit, input_weight: f64, output_weight: f64) -> Self {
        Self {
            window: unit.as_duration(window_amount),
            unit,
            input_weight: input_weight.max(0.0),
            output_weight: output_weight.max(0.0),
            windows: RwLock::new(HashMap::new()),
            totals_index: RwLock::new(BTreeMap::new()),
        }
    }

    fn now_ts(&self) -> i64 {
        let now = chrono::Utc::now();
        match self.unit {
            TimeUnit::Millis => now.timestamp_millis(),
            TimeUnit::Seconds => now.timestamp(),
            TimeUnit::Minutes => now.timestamp() / 60,
        }
    }

    fn window_ticks(&self) -> i64 {
        match self.unit {
            TimeUnit::Millis => self.window.as_millis() as i64,
            TimeUnit::Seconds => self.window.as_secs() as i64,
            TimeUnit::Minutes => (self.window.as_secs() / 60) as i64,
        }
    }

    fn reindex_total(&self, key: &Key, old_total: f64, new_total: f64) {
        if (old_total - new_total).abs() < f64::EPSILON {
            return;
        }
        let mut idx = self.totals_index.write();
        if old_total > 0.0 {
            if let Some(set) = idx.get_mut(&old_total.to_bits()) {
                set.remove(key);
                if set.is_empty() {
                    idx.remove(&old_total.to_bits());
                }
            }
        }
        if new_total > 0.0 {
            idx.entry(new_total.to_bits())
                .or_default()
                .insert(key.clone());
        }
    }

    /// Record `in_tokens`/`out_tokens` for `(user, model)` at the current
    /// time, pruning any bucket older than the window first. Negative
    /// deltas are clamped to 0 (see SPEC_FULL.md Open Question on
    /// `updateTokenCount` semantics).
    pub fn update_token_count(&self, user: &str, model: &str, in_tokens: f64, out_tokens: f64) {
        let key = (user.to_string(), model.to_string());
        let now = self.now_ts();
        let cutoff = now - self.window_ticks();
        let delta = in_tokens.max(0.0) * self.input_weight + out_tokens.max(0.0) * self.output_weight;

        let mut windows = self.windows.write();
        let entry = windows.entry(key.clone()).or_default();
        let old_total = entry.total;

        Self::prune_locked(entry, cutoff);

        if let Some(back) = entry.buckets.back_mut() {
            if back.ts == now {
                back.weight += delta;
            } else {
                entry.buckets.push_back(Bucket { ts: now, weight: delta });
            }
        } else {
            entry.buckets.push_back(Bucket { ts: now, weight: delta });
        }

        entry.total = (entry.total + delta).max(0.0);
        let new_total = entry.total;
        drop(windows);

        self.reindex_total(&key, old_total, new_total);
    }

    fn prune_locked(window: &mut Window, cutoff: i64) {
        while let Some(front) = window.buckets.front() {
            if front.ts < cutoff {
                let removed = window.buckets.pop_front().unwrap();
                window.total = (window.total - removed.weight).max(0.0);
            } else {
                break;
            }
        }
    }

    /// Current weighted token total for `(user, model)`, pruning expired
    /// buckets first if the oldest one has aged out.
    pub fn get_token_count(&self, user: &str, model: &str) -> f64 {
        let key = (user.to_string(), model.to_string());
        let now = self.now_ts();
        let cutoff = now - self.window_ticks();

        // Read-only fast path: nothing to prune.
        {
            let windows = self.windows.read();
            match windows.get(&key) {
                Some(w) => {
                    if w.buckets.front().map(|b| b.ts >= cutoff).unwrap_or(true) {
                        return w.total;
                    }
                }
                None => return 0.0,
            }
        }

        // Slow path: upgrade to a write lock and prune.
        let mut windows = self.windows.write();
        let old_total = windows.get(&key).map(|w| w.total).unwrap_or(0.0);
        if let Some(w) = windows.get_mut(&key) {
            Self::prune_locked(w, cutoff);
            let new_total = w.total;
            drop(windows);
            self.reindex_total(&key, old_total, new_total);
            new_total
        } else {
            0.0
        }
    }

    /// Minimum positive total across all tracked `(user, model)` pairs, or
    /// `NO_TRACKED_TOKENS` if none are positive.
    pub fn min_token_count(&self) -> f64 {
        self.totals_index
            .read()
            .keys()
            .next()
            .map(|bits| f64::from_bits(*bits))
            .unwrap_or(NO_TRACKED_TOKENS)
    }

    /// Maximum positive total across all tracked `(user, model)` pairs, or
    /// `NO_TRACKED_TOKENS` if none are positive.
    pub fn max_token_count(&self) -> f64 {
        self.totals_index
            .read()
            .keys()
            .next_back()
            .map(|bits| f64::from_bits(*bits))
            .unwrap_or(NO_TRACKED_TOKENS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_accumulates_within_window() {
        let tracker = TokenTracker::new(60, TimeUnit::Seconds, 1.0, 2.0);
        tracker.update_token_count("u1", "m1", 10.0, 5.0);
        // 10*1 + 5*2 = 20
        assert_eq!(tracker.get_token_count("u1", "m1"), 20.0);
        tracker.update_token_count("u1", "m1", 10.0, 0.0);
        assert_eq!(tracker.get_token_count("u1", "m1"), 30.0);
    }

    #[test]
    fn negative_deltas_are_clamped() {
        let tracker = TokenTracker::new(60, TimeUnit::Seconds, 1.0, 1.0);
        tracker.update_token_count("u1", "m1", -50.0, -50.0);
        assert_eq!(tracker.get_token_count("u1", "m1"), 0.0);
    }

    #[test]
    fn unknown_pair_returns_zero() {
        let tracker = TokenTracker::new(60, TimeUnit::Seconds, 1.0, 1.0);
        assert_eq!(tracker.get_token_count("nobody", "nothing"), 0.0);
    }

    #[test]
    fn min_max_revert_to_sentinel_when_empty() {
        let tracker = TokenTracker::new(60, TimeUnit::Seconds, 1.0, 1.0);
        assert_eq!(tracker.min_token_count(), NO_TRACKED_TOKENS);
        assert_eq!(tracker.max_token_count(), NO_TRACKED_TOKENS);
    }

    #[test]
    fn min_max_track_multiple_users() {
        let tracker = TokenTracker::new(60, TimeUnit::Seconds, 1.0, 0.0);
        tracker.update_token_count("u1", "m1", 10.0, 0.0);
        tracker.update_token_count("u2", "m1", 50.0, 0.0);
        assert_eq!(tracker.min_token_count(), 10.0);
        assert_eq!(tracker.max_token_count(), 50.0);
    }
}
