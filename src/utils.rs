use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microseconds since process start. Used as the presentation
/// timestamp assigned at feed time; only ever compared against itself
/// for latency measurement.
pub fn time_us() -> i64 {
    PROCESS_EPOCH.elapsed().as_micros() as i64
}

/// Rolling average over a set of durations, logged in intervals.
#[derive(Debug)]
pub struct RollingAverage {
    sum: Duration,
    count: u32,
    last_log: Instant,
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self {
            sum: Duration::ZERO,
            count: 0,
            last_log: Instant::now(),
        }
    }
}

impl RollingAverage {
    pub fn add(&mut self, sample: Duration) {
        self.sum += sample;
        self.count += 1;
    }

    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum / self.count)
    }

    pub fn reset(&mut self) {
        self.sum = Duration::ZERO;
        self.count = 0;
    }

    pub fn time_since_last_log(&self) -> Duration {
        self.last_log.elapsed()
    }

    pub fn set_last_log(&mut self) {
        self.last_log = Instant::now();
    }

    /// Human readable average, e.g. "3.42ms"
    pub fn average_readable(&self) -> String {
        match self.average() {
            Some(avg) => format!("{:.2}ms", avg.as_secs_f64() * 1000.0),
            None => "-".to_string(),
        }
    }
}

/// Promote the calling thread to real-time scheduling and pin it to the
/// last CPU core. The decode thread sits in the latency-critical
/// feed/drain lockstep. Failure is logged and ignored, this needs
/// CAP_SYS_NICE on most systems.
pub fn request_realtime_scheduling() {
    unsafe {
        let param = libc::sched_param {
            sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO),
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            warn!("could not enable SCHED_FIFO for decode thread (needs CAP_SYS_NICE)");
        } else {
            debug!("decode thread promoted to SCHED_FIFO");
        }
    }

    if let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().last()) {
        if core_affinity::set_for_current(core) {
            debug!("decode thread pinned to core {:?}", core.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_us_is_monotonic() {
        let a = time_us();
        let b = time_us();
        assert!(b >= a);
    }

    #[test]
    fn rolling_average_averages_and_resets() {
        let mut avg = RollingAverage::default();
        assert!(avg.average().is_none());
        avg.add(Duration::from_millis(10));
        avg.add(Duration::from_millis(20));
        assert_eq!(avg.average(), Some(Duration::from_millis(15)));
        avg.reset();
        assert!(avg.average().is_none());
    }
}
