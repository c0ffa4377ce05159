use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::scheduler::pool::PoolSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    /// Spawn one worker
    Grow,
    /// Retire the longest-idle worker
    Shrink,
}

/// Auto-scale rule evaluated once per scale tick.
///
/// Grows by one when jobs are waiting and nobody is idle, shrinks by one
/// after the idle count stayed above the high-water mark for enough
/// consecutive ticks. Actions are spaced by at least `cooldown`.
#[derive(Debug, Clone)]
pub struct ScalePolicy {
    min_workers: usize,
    max_workers: usize,
    idle_high_water: usize,
    idle_ticks_before_shrink: u32,
    cooldown: Duration,
    idle_streak: u32,
    last_action: Option<Instant>,
}

impl ScalePolicy {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            idle_high_water: config.idle_high_water,
            idle_ticks_before_shrink: config.idle_ticks_before_shrink,
            cooldown: config.scale_cooldown(),
            idle_streak: 0,
            last_action: None,
        }
    }

    pub fn decide(&mut self, queue_depth: usize, pool: PoolSnapshot, now: Instant) -> ScaleDecision {
        if pool.idle > self.idle_high_water {
            self.idle_streak = self.idle_streak.saturating_add(1);
        } else {
            self.idle_streak = 0;
        }

        if self.cooling_down(now) {
            return ScaleDecision::Hold;
        }

        let size = pool.size();
        if queue_depth > 0 && pool.idle == 0 && size < self.max_workers {
            self.last_action = Some(now);
            return ScaleDecision::Grow;
        }

        if self.idle_streak >= self.idle_ticks_before_shrink && size > self.min_workers && pool.idle > 0 {
            self.idle_streak = 0;
            self.last_action = Some(now);
            return ScaleDecision::Shrink;
        }

        ScaleDecision::Hold
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.last_action
            .map(|at| now.saturating_duration_since(at) < self.cooldown)
            .unwrap_or(false)
    }

    pub fn idle_streak(&self) -> u32 {
        self.idle_streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalePolicy {
        ScalePolicy::new(&PoolConfig {
            min_workers: 1,
            max_workers: 3,
            scale_cooldown_ms: 100,
            idle_high_water: 1,
            idle_ticks_before_shrink: 3,
            ..PoolConfig::default()
        })
    }

    fn snap(starting: usize, idle: usize, busy: usize) -> PoolSnapshot {
        PoolSnapshot { starting, idle, busy }
    }

    #[test]
    fn grows_when_queue_waits_and_nobody_idle() {
        let mut p = policy();
        let now = Instant::now();
        assert_eq!(p.decide(2, snap(0, 0, 1), now), ScaleDecision::Grow);
    }

    #[test]
    fn cooldown_spaces_actions() {
        let mut p = policy();
        let now = Instant::now();
        assert_eq!(p.decide(2, snap(0, 0, 1), now), ScaleDecision::Grow);
        assert_eq!(
            p.decide(2, snap(1, 0, 1), now + Duration::from_millis(50)),
            ScaleDecision::Hold
        );
        assert_eq!(
            p.decide(2, snap(0, 0, 2), now + Duration::from_millis(150)),
            ScaleDecision::Grow
        );
    }

    #[test]
    fn never_grows_past_max() {
        let mut p = policy();
        assert_eq!(p.decide(10, snap(0, 0, 3), Instant::now()), ScaleDecision::Hold);
    }

    #[test]
    fn shrinks_after_consecutive_idle_ticks() {
        let mut p = policy();
        let start = Instant::now();
        assert_eq!(p.decide(0, snap(0, 3, 0), start), ScaleDecision::Hold);
        assert_eq!(
            p.decide(0, snap(0, 3, 0), start + Duration::from_millis(10)),
            ScaleDecision::Hold
        );
        assert_eq!(
            p.decide(0, snap(0, 3, 0), start + Duration::from_millis(20)),
            ScaleDecision::Shrink
        );
        assert_eq!(p.idle_streak(), 0);
    }

    #[test]
    fn busy_tick_resets_idle_streak() {
        let mut p = policy();
        let start = Instant::now();
        p.decide(0, snap(0, 3, 0), start);
        p.decide(0, snap(0, 3, 0), start);
        p.decide(0, snap(0, 1, 2), start);
        assert_eq!(p.idle_streak(), 0);
    }

    #[test]
    fn never_shrinks_below_min() {
        let mut p = ScalePolicy::new(&PoolConfig {
            min_workers: 2,
            max_workers: 3,
            idle_high_water: 1,
            idle_ticks_before_shrink: 1,
            ..PoolConfig::default()
        });
        assert_eq!(p.decide(0, snap(0, 2, 0), Instant::now()), ScaleDecision::Hold);
    }
}
