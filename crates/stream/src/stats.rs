use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Counters describing the stream after the most recent tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub tick: u64,
    /// Load radius in effect for the tick.
    pub radius: f32,
    pub resident: usize,
    pub queued: usize,
    /// Coordinates queued or building.
    pub pending: usize,
    pub building: usize,
    pub dirty: usize,
    pub enqueued_this_tick: usize,
    pub started_this_tick: usize,
    pub evicted_this_tick: usize,
    pub launched_total: u64,
    pub completed_total: u64,
    pub stale_total: u64,
    pub failed_total: u64,
    pub tick_time: Duration,
}

impl std::fmt::Display for StreamStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stream: tick={} radius={:.1} resident={} queued={} pending={} building={} dirty={} \
             | launched={} completed={} stale={} failed={} | tick_time={:?}",
            self.tick,
            self.radius,
            self.resident,
            self.queued,
            self.pending,
            self.building,
            self.dirty,
            self.launched_total,
            self.completed_total,
            self.stale_total,
            self.failed_total,
            self.tick_time,
        )
    }
}

/// Rolling window of tick durations.
#[derive(Debug, Clone)]
pub struct TickTimer {
    window: VecDeque<Duration>,
    capacity: usize,
}

impl TickTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(dt);
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }

    pub fn average(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        self.window.iter().sum::<Duration>() / self.window.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.window.iter().copied().max().unwrap_or_default()
    }

    pub fn min(&self) -> Duration {
        self.window.iter().copied().min().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_core_counters() {
        let stats = StreamStats {
            resident: 7,
            queued: 2,
            pending: 3,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("resident=7"));
        assert!(text.contains("queued=2"));
        assert!(text.contains("pending=3"));
    }

    #[test]
    fn timer_summarises_window() {
        let mut timer = TickTimer::new(3);
        for ms in [10, 20, 30] {
            timer.record(Duration::from_millis(ms));
        }
        assert_eq!(timer.count(), 3);
        assert_eq!(timer.average(), Duration::from_millis(20));
        assert_eq!(timer.max(), Duration::from_millis(30));
        assert_eq!(timer.min(), Duration::from_millis(10));
    }

    #[test]
    fn timer_drops_oldest_when_full() {
        let mut timer = TickTimer::new(2);
        for ms in [10, 20, 30] {
            timer.record(Duration::from_millis(ms));
        }
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.average(), Duration::from_millis(25));
    }

    #[test]
    fn empty_timer_reads_zero() {
        let timer = TickTimer::new(0);
        assert_eq!(timer.average(), Duration::ZERO);
        assert_eq!(timer.max(), Duration::ZERO);
    }
}
