//! Per-worker statistics, load gauges and aggregate views.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::CacheStats;

/// Event-loop counters for one worker.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerStats {
    pub n_reads: u64,
    pub n_writes: u64,
    pub n_errors: u64,
    pub n_hangups: u64,
    pub n_accepts: u64,
    pub n_polls: u64,
    pub n_events: u64,
    pub n_tasks: u64,
    /// Readiness-queue length: running average numerator and max.
    pub evq_max: usize,
    evq_sum: u64,
    /// Worst handler execution and inbox queue delay observed.
    pub max_exec_us: u64,
    pub max_queue_us: u64,
    pub fds_current: usize,
    pub fds_total: u64,
}

impl WorkerStats {
    pub fn record_poll(&mut self, ready: usize) {
        self.n_polls += 1;
        self.n_events += ready as u64;
        self.evq_sum += ready as u64;
        self.evq_max = self.evq_max.max(ready);
    }

    pub fn record_exec(&mut self, elapsed: Duration) {
        self.max_exec_us = self.max_exec_us.max(elapsed.as_micros() as u64);
    }

    pub fn record_queue_delay(&mut self, delay: Duration) {
        self.n_tasks += 1;
        self.max_queue_us = self.max_queue_us.max(delay.as_micros() as u64);
    }

    /// Average readiness-queue length per poll.
    pub fn evq_avg(&self) -> f64 {
        if self.n_polls == 0 {
            0.0
        } else {
            self.evq_sum as f64 / self.n_polls as f64
        }
    }
}

/// Memory accounted to one worker.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryUsage {
    pub statement_cache: u64,
    pub zombies: u64,
    pub sessions: u64,
    pub total: u64,
}

impl MemoryUsage {
    pub fn finish(mut self) -> Self {
        self.total = self.statement_cache + self.zombies + self.sessions;
        self
    }

    pub fn absorb(&mut self, rhs: &MemoryUsage) {
        self.statement_cache += rhs.statement_cache;
        self.zombies += rhs.zombies;
        self.sessions += rhs.sessions;
        self.total += rhs.total;
    }
}

/// Introspection snapshot of one worker, collected by serial broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker: usize,
    pub stats: WorkerStats,
    pub load_1s: u32,
    pub load_1m: u32,
    pub load_1h: u32,
    pub sessions: usize,
    pub zombies: usize,
    pub cache: CacheStats,
    pub memory: MemoryUsage,
}

/// Sum/max fold over all workers' stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub n_reads: u64,
    pub n_writes: u64,
    pub n_errors: u64,
    pub n_hangups: u64,
    pub n_accepts: u64,
    pub n_polls: u64,
    pub n_events: u64,
    pub evq_avg: f64,
    pub evq_max: usize,
    pub max_exec_us: u64,
    pub max_queue_us: u64,
    pub fds_current: usize,
    pub fds_total: u64,
    pub sessions: usize,
}

impl AggregateStats {
    pub fn fold(infos: &[WorkerInfo]) -> Self {
        let mut agg = AggregateStats::default();
        for info in infos {
            let s = &info.stats;
            agg.n_reads += s.n_reads;
            agg.n_writes += s.n_writes;
            agg.n_errors += s.n_errors;
            agg.n_hangups += s.n_hangups;
            agg.n_accepts += s.n_accepts;
            agg.n_polls += s.n_polls;
            agg.n_events += s.n_events;
            agg.evq_avg += s.evq_avg();
            agg.evq_max = agg.evq_max.max(s.evq_max);
            agg.max_exec_us = agg.max_exec_us.max(s.max_exec_us);
            agg.max_queue_us = agg.max_queue_us.max(s.max_queue_us);
            agg.fds_current += s.fds_current;
            agg.fds_total += s.fds_total;
            agg.sessions += info.sessions;
        }
        if !infos.is_empty() {
            agg.evq_avg /= infos.len() as f64;
        }
        agg
    }
}

/// Published load percentages for one worker. Written by the owning
/// worker only; read by the coordinator with relaxed loads.
#[derive(Debug, Default)]
pub struct LoadGauge {
    one_second: AtomicU32,
    one_minute: AtomicU32,
    one_hour: AtomicU32,
}

/// Averaging interval selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadInterval {
    OneSecond,
    OneMinute,
    OneHour,
}

impl LoadGauge {
    pub fn load(&self, interval: LoadInterval) -> u32 {
        match interval {
            LoadInterval::OneSecond => self.one_second.load(Ordering::Relaxed),
            LoadInterval::OneMinute => self.one_minute.load(Ordering::Relaxed),
            LoadInterval::OneHour => self.one_hour.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, s: u32, m: u32, h: u32) {
        self.one_second.store(s, Ordering::Release);
        self.one_minute.store(m, Ordering::Release);
        self.one_hour.store(h, Ordering::Release);
    }
}

/// Worker-private accumulator behind a [`LoadGauge`]: fraction of wall
/// time spent executing handlers versus blocked in the readiness call.
pub struct LoadTracker {
    busy: Duration,
    waiting: Duration,
    window_start: Instant,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self {
            busy: Duration::ZERO,
            waiting: Duration::ZERO,
            window_start: Instant::now(),
            seconds: Vec::with_capacity(60),
            minutes: Vec::with_capacity(60),
        }
    }

    /// Account one loop turn and roll the one-second window over when
    /// due. Returns true when a new sample was published.
    pub fn record_turn(&mut self, waited: Duration, worked: Duration, gauge: &LoadGauge) -> bool {
        self.waiting += waited;
        self.busy += worked;
        if self.window_start.elapsed() < Duration::from_secs(1) {
            return false;
        }
        let total = self.busy + self.waiting;
        let pct = if total.is_zero() {
            0
        } else {
            ((self.busy.as_secs_f64() / total.as_secs_f64()) * 100.0).round() as u32
        };
        self.busy = Duration::ZERO;
        self.waiting = Duration::ZERO;
        self.window_start = Instant::now();

        push_bounded(&mut self.seconds, pct, 60);
        if self.seconds.len() == 60 {
            let minute = avg(&self.seconds);
            push_bounded(&mut self.minutes, minute, 60);
            self.seconds.clear();
        }
        let minute_avg = if self.seconds.is_empty() {
            self.minutes.last().copied().unwrap_or(pct)
        } else {
            avg(&self.seconds)
        };
        let hour_avg = if self.minutes.is_empty() {
            minute_avg
        } else {
            avg(&self.minutes)
        };
        gauge.publish(pct, minute_avg, hour_avg);
        true
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(v: &mut Vec<u32>, value: u32, cap: usize) {
    if v.len() == cap {
        v.remove(0);
    }
    v.push(value);
}

fn avg(v: &[u32]) -> u32 {
    if v.is_empty() {
        0
    } else {
        (v.iter().map(|&x| x as u64).sum::<u64>() / v.len() as u64) as u32
    }
}
