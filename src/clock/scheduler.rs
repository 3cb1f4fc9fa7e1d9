//! Drift-correcting periodic timers.
//!
//! Timers are not driven by the OS. The driving loop calls
//! [`Scheduler::run_due`] on a short fixed tick and each timer decides whether
//! one of its periods has elapsed since the shared anchor. A timer that fell
//! behind (a slow tick, a suspended laptop) jumps straight to the current
//! period instead of replaying every missed one.
//!
//! ```text
//! anchor        P        2P        3P   ...   10P       11P
//!   |---------|---------|---------|-- ... --|---------|
//!   ^ fire                                  ^ late tick: offset := 10, fire once
//! ```

use tracing::trace;

use super::time::SharedTimeSource;

/// Callback invoked when a timer is due.
///
/// Receives the loop-owned context and the instant the timer fired at.
pub type TimerCallback<Ctx> = Box<dyn FnMut(&mut Ctx, Tick) -> anyhow::Result<()> + Send>;

/// Instants passed to a firing timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Wall-clock seconds.
    pub epoch: f64,
    /// Sidereal seconds at `epoch`.
    pub sidereal: f64,
}

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

struct Timer<Ctx> {
    name: String,
    period_ms: u64,
    offset: u64,
    callback: TimerCallback<Ctx>,
}

impl<Ctx> Timer<Ctx> {
    fn period_secs(&self) -> f64 {
        self.period_ms as f64 / 1000.0
    }

    /// Catch up and report whether the timer should fire at `now`.
    fn due(&mut self, anchor: f64, now: f64) -> bool {
        if self.period_ms == 0 {
            return false;
        }
        let period = self.period_secs();
        if now >= anchor + period * (self.offset + 1) as f64 {
            let caught_up = ((now - anchor) / period).floor() as u64;
            trace!(timer = %self.name, from = self.offset, to = caught_up, "Timer caught up");
            self.offset = caught_up;
        }
        now >= anchor + period * self.offset as f64
    }
}

/// Set of independently periodic timers sharing one anchor instant.
pub struct Scheduler<Ctx> {
    source: SharedTimeSource,
    anchor: f64,
    timers: Vec<Timer<Ctx>>,
}

impl<Ctx> Scheduler<Ctx> {
    /// Create an empty scheduler anchored at the current instant.
    pub fn new(source: SharedTimeSource) -> Self {
        let anchor = source.now();
        Self {
            source,
            anchor,
            timers: Vec::new(),
        }
    }

    /// Register a timer firing every `period_ms` milliseconds.
    pub fn add_timer<F>(&mut self, name: impl Into<String>, period_ms: u64, callback: F) -> TimerHandle
    where
        F: FnMut(&mut Ctx, Tick) -> anyhow::Result<()> + Send + 'static,
    {
        self.timers.push(Timer {
            name: name.into(),
            period_ms,
            offset: 0,
            callback: Box::new(callback),
        });
        TimerHandle(self.timers.len() - 1)
    }

    /// Change a timer's period. The offset restarts only if the period changed.
    pub fn set_period(&mut self, handle: TimerHandle, period_ms: u64) {
        if let Some(timer) = self.timers.get_mut(handle.0) {
            if timer.period_ms != period_ms {
                timer.offset = 0;
            }
            timer.period_ms = period_ms;
        }
    }

    /// Cancel a timer. A cancelled timer is never due.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(timer) = self.timers.get_mut(handle.0) {
            timer.period_ms = 0;
        }
    }

    /// Period of a timer in milliseconds (0 when cancelled).
    pub fn period(&self, handle: TimerHandle) -> Option<u64> {
        self.timers.get(handle.0).map(|t| t.period_ms)
    }

    /// Number of periods a timer has consumed since the anchor.
    pub fn offset(&self, handle: TimerHandle) -> Option<u64> {
        self.timers.get(handle.0).map(|t| t.offset)
    }

    /// Instant all timer periods are measured from.
    pub fn anchor(&self) -> f64 {
        self.anchor
    }

    /// Re-anchor every timer at the current instant so they all fire on the next tick.
    pub fn reset_anchor(&mut self) {
        let now = self.source.now();
        self.reset_anchor_at(now);
    }

    /// Re-anchor every timer at `epoch`.
    pub fn reset_anchor_at(&mut self, epoch: f64) {
        self.anchor = epoch;
        for timer in &mut self.timers {
            timer.offset = 0;
        }
    }

    /// Fire every due timer once.
    ///
    /// `sidereal_at` converts the firing instant to sidereal time for the
    /// [`Tick`]. Returns how many timers fired. The first callback error
    /// aborts the pass and is returned; that timer stays due and is retried
    /// on the next call.
    pub fn run_due<S>(&mut self, ctx: &mut Ctx, sidereal_at: S) -> anyhow::Result<usize>
    where
        S: Fn(f64) -> f64,
    {
        let now = self.source.now();
        let anchor = self.anchor;
        let mut fired = 0;
        for timer in &mut self.timers {
            if timer.due(anchor, now) {
                (timer.callback)(
                    ctx,
                    Tick {
                        epoch: now,
                        sidereal: sidereal_at(now),
                    },
                )?;
                timer.offset += 1;
                fired += 1;
            }
        }
        Ok(fired)
    }
}

impl<Ctx> std::fmt::Debug for Scheduler<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timers: Vec<_> = self
            .timers
            .iter()
            .map(|t| format!("{}({}ms, offset {})", t.name, t.period_ms, t.offset))
            .collect();
        f.debug_struct("Scheduler")
            .field("anchor", &self.anchor)
            .field("timers", &timers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::time::ManualTime;
    use std::sync::Arc;

    fn counting_scheduler(start: f64) -> (Arc<ManualTime>, Scheduler<Vec<f64>>) {
        let time = ManualTime::shared(start);
        let scheduler = Scheduler::new(time.clone());
        (time, scheduler)
    }

    fn record(ctx: &mut Vec<f64>, tick: Tick) -> anyhow::Result<()> {
        ctx.push(tick.epoch);
        Ok(())
    }

    #[test]
    fn fires_immediately_after_anchor() {
        let (_time, mut scheduler) = counting_scheduler(0.0);
        let mut fired = Vec::new();
        scheduler.add_timer("sample", 100, record);
        assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 1);
        assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 0);
        assert_eq!(fired, vec![0.0]);
    }

    #[test]
    fn fires_once_per_period() {
        let (time, mut scheduler) = counting_scheduler(0.0);
        let mut fired = Vec::new();
        scheduler.add_timer("sample", 100, record);
        for _ in 0..10 {
            scheduler.run_due(&mut fired, |t| t).unwrap();
            time.advance(0.03);
        }
        // ticks at 0.00 .. 0.27 reach periods 0, 1 and 2
        assert_eq!(fired.len(), 3);
    }

    #[test]
    fn late_tick_catches_up_in_one_step() {
        let (time, mut scheduler) = counting_scheduler(0.0);
        let mut fired = Vec::new();
        let handle = scheduler.add_timer("sample", 100, record);
        scheduler.run_due(&mut fired, |t| t).unwrap();
        assert_eq!(scheduler.offset(handle), Some(1));

        time.advance(1.0);
        assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 1);
        // caught up to period 10, consumed it
        assert_eq!(scheduler.offset(handle), Some(11));
        assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 0);
        assert_eq!(fired.len(), 2);

        time.advance(0.15);
        assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 1);
    }

    #[test]
    fn cancelled_timer_is_never_due() {
        let (time, mut scheduler) = counting_scheduler(0.0);
        let mut fired = Vec::new();
        let handle = scheduler.add_timer("sample", 100, record);
        scheduler.cancel(handle);
        for _ in 0..5 {
            assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 0);
            time.advance(1.0);
        }
        assert_eq!(scheduler.period(handle), Some(0));
    }

    #[test]
    fn set_period_restarts_offset_only_on_change() {
        let (time, mut scheduler) = counting_scheduler(0.0);
        let mut fired = Vec::new();
        let handle = scheduler.add_timer("sample", 100, record);
        scheduler.run_due(&mut fired, |t| t).unwrap();
        time.advance(0.1);
        scheduler.run_due(&mut fired, |t| t).unwrap();
        assert_eq!(scheduler.offset(handle), Some(2));

        scheduler.set_period(handle, 100);
        assert_eq!(scheduler.offset(handle), Some(2));

        scheduler.set_period(handle, 250);
        assert_eq!(scheduler.offset(handle), Some(0));
    }

    #[test]
    fn reset_anchor_fires_all_timers_immediately() {
        let (time, mut scheduler) = counting_scheduler(0.0);
        let mut fired = Vec::new();
        scheduler.add_timer("slow", 10_000, record);
        scheduler.add_timer("fast", 100, record);
        scheduler.run_due(&mut fired, |t| t).unwrap();
        time.advance(0.3);
        scheduler.reset_anchor();
        fired.clear();
        assert_eq!(scheduler.run_due(&mut fired, |t| t).unwrap(), 2);
        assert_eq!(scheduler.anchor(), 0.3);
    }

    #[test]
    fn callback_errors_propagate_and_retry() {
        let mut scheduler: Scheduler<u32> = Scheduler::new(ManualTime::shared(0.0));
        let handle = scheduler.add_timer("failing", 100, |count: &mut u32, _| {
            *count += 1;
            anyhow::bail!("transport closed")
        });
        let mut attempts = 0u32;
        assert!(scheduler.run_due(&mut attempts, |t| t).is_err());
        assert!(scheduler.run_due(&mut attempts, |t| t).is_err());
        assert_eq!(attempts, 2);
        assert_eq!(scheduler.offset(handle), Some(0));
    }

    #[test]
    fn tick_carries_sidereal_time() {
        let mut scheduler: Scheduler<Vec<Tick>> = Scheduler::new(ManualTime::shared(10.0));
        let mut ticks = Vec::new();
        scheduler.add_timer("sample", 100, |ticks: &mut Vec<Tick>, tick| {
            ticks.push(tick);
            Ok(())
        });
        scheduler.run_due(&mut ticks, |t| t * 2.0).unwrap();
        assert_eq!(ticks, vec![Tick { epoch: 10.0, sidereal: 20.0 }]);
    }
}
