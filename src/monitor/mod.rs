//! Timeline of memory usage, split into named and nestable events.
//!
//! While tracking, every storage change reported through
//! [`UsageProfiler::record()`] becomes a sample `(time, usage)` on the
//! innermost open event. Samples closer together than the granularity are
//! folded into one, so a tight loop of reallocations costs one sample rather
//! than thousands.
//!
//! ```
//! use bitmem::monitor::UsageProfiler;
//!
//! let profiler = UsageProfiler::new();
//! profiler.start();
//! profiler.scoped("build", || profiler.record(4096));
//! profiler.stop();
//! assert_eq!(profiler.peak(), 4096);
//! ```

pub mod report;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use log::debug;
use serde::{Deserialize, Serialize};

use self::report::UsageReport;
use crate::serialize::serde_nanos;

pub const DEFAULT_GRANULARITY: Duration = Duration::from_millis(20);

/// Name of the event that is always at the bottom of the stack.
pub const ROOT_EVENT: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Time since `start()`
    #[serde(with = "serde_nanos")]
    pub time: Duration,
    /// Total bytes in use at `time`
    pub usage: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub name: String,
    /// 0 for the root event, 1 for events directly inside it, and so on.
    pub depth: usize,
    /// Never empty, ordered by time.
    pub samples: Vec<Sample>,
}

impl UsageEvent {
    fn new(name: impl Into<String>, depth: usize, first: Sample) -> Self {
        Self {
            name: name.into(),
            depth,
            samples: vec![first],
        }
    }

    /// First and last sample time.
    pub fn span(&self) -> Option<(Duration, Duration)> {
        Some((self.samples.first()?.time, self.samples.last()?.time))
    }

    pub fn peak(&self) -> i64 {
        self.samples.iter().map(|s| s.usage).max().unwrap_or(0)
    }
}

struct State {
    granularity: Duration,
    current_usage: i64,
    event_stack: Vec<UsageEvent>,
    completed: Vec<UsageEvent>,
    start_log: Instant,
    last_event: Instant,
    /// Bumped by every `start()`, so guards can tell whether the event they
    /// opened still exists.
    session: u64,
}

impl State {
    fn sample(&self, now: Instant) -> Sample {
        Sample {
            time: now.saturating_duration_since(self.start_log),
            usage: self.current_usage,
        }
    }
}

/// Records usage samples for a tree of events. Idle until [`start()`] and
/// again after [`stop()`]; while idle every method except the queries is a
/// no-op that does not take the lock.
///
/// [`start()`]: Self::start
/// [`stop()`]: Self::stop
pub struct UsageProfiler {
    tracking: AtomicBool,
    state: Mutex<State>,
}

impl Default for UsageProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProfiler {
    pub fn new() -> Self {
        Self::with_granularity(DEFAULT_GRANULARITY)
    }

    pub fn with_granularity(granularity: Duration) -> Self {
        let now = Instant::now();
        Self {
            tracking: AtomicBool::new(false),
            state: Mutex::new(State {
                granularity,
                current_usage: 0,
                event_stack: Vec::new(),
                completed: Vec::new(),
                start_log: now,
                last_event: now,
                session: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Minimum time between two separately kept samples. Takes effect for the
    /// next `record()`, even mid-session.
    pub fn set_granularity(&self, granularity: Duration) {
        self.state().granularity = granularity;
    }

    pub fn granularity(&self) -> Duration {
        self.state().granularity
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    /// Throw away everything recorded so far and start a new session with an
    /// empty root event at usage 0.
    pub fn start(&self) {
        let mut state = self.state();
        let now = Instant::now();
        state.completed.clear();
        state.event_stack.clear();
        state.start_log = now;
        state.last_event = now;
        state.current_usage = 0;
        state.session += 1;
        let root = UsageEvent::new(ROOT_EVENT, 0, state.sample(now));
        state.event_stack.push(root);
        self.tracking.store(true, Ordering::Release);
        debug!("usage profiler session {} started", state.session);
    }

    /// Close every open event, innermost first, each with a final sample at
    /// the current usage.
    pub fn stop(&self) {
        let mut state = self.state();
        if !self.tracking.swap(false, Ordering::AcqRel) {
            return;
        }
        let last = state.sample(Instant::now());
        while let Some(mut event) = state.event_stack.pop() {
            event.samples.push(last);
            state.completed.push(event);
        }
        debug!(
            "usage profiler session {} stopped with {} events",
            state.session,
            state.completed.len()
        );
    }

    /// Add `delta` bytes to the running total.
    pub fn record(&self, delta: i64) {
        if !self.tracking.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.state();
        // `stop()` may have won the race for the lock.
        if !self.is_tracking() {
            return;
        }
        let now = Instant::now();
        let before = state.sample(now);
        state.current_usage += delta;
        let after = state.sample(now);
        let fold = now.saturating_duration_since(state.last_event) < state.granularity;
        if !fold {
            state.last_event = now;
        }
        let Some(top) = state.event_stack.last_mut() else {
            return;
        };
        if fold {
            if let Some(last) = top.samples.last_mut() {
                *last = after;
                return;
            }
        }
        top.samples.extend([before, after]);
    }

    /// Open an event named `name` inside the current one. It is closed when
    /// the returned guard is dropped, whichever way the scope is left.
    pub fn event(&self, name: impl Into<String>) -> EventGuard<'_> {
        if !self.tracking.load(Ordering::Relaxed) {
            return EventGuard::inert(self);
        }
        let mut state = self.state();
        if !self.is_tracking() {
            return EventGuard::inert(self);
        }
        let first = state.sample(Instant::now());
        let depth = state.event_stack.len();
        state.event_stack.push(UsageEvent::new(name, depth, first));
        EventGuard {
            profiler: self,
            session: Some(state.session),
        }
    }

    /// Run `f` inside an event named `name`.
    pub fn scoped<R>(&self, name: impl Into<String>, f: impl FnOnce() -> R) -> R {
        let _event = self.event(name);
        f()
    }

    fn close_event(&self, session: u64) {
        let mut state = self.state();
        if !self.is_tracking() || state.session != session || state.event_stack.len() <= 1 {
            return;
        }
        let last = state.sample(Instant::now());
        if let Some(mut event) = state.event_stack.pop() {
            event.samples.push(last);
            state.completed.push(event);
        }
        // The parent sees the same usage at the same instant, so its own
        // samples never silently span the child.
        if let Some(parent) = state.event_stack.last_mut() {
            parent.samples.push(last);
        }
    }

    /// Highest usage among the completed events. Events still open are only
    /// counted after `stop()`.
    pub fn peak(&self) -> i64 {
        self.state()
            .completed
            .iter()
            .map(UsageEvent::peak)
            .max()
            .unwrap_or(0)
            .max(0)
    }

    pub fn current_usage(&self) -> i64 {
        self.state().current_usage
    }

    /// Completed events in the order they were closed.
    pub fn completed_events(&self) -> Vec<UsageEvent> {
        self.state().completed.clone()
    }

    /// The completed events ordered by when they started (ties go to the one
    /// that ended first), ready to be drawn.
    pub fn report(&self) -> UsageReport {
        let state = self.state();
        let mut events = state.completed.clone();
        events.sort_by_key(|event| event.span());
        UsageReport {
            granularity: state.granularity,
            peak: events.iter().map(UsageEvent::peak).max().unwrap_or(0).max(0),
            events,
        }
    }
}

impl fmt::Debug for UsageProfiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("UsageProfiler")
            .field("tracking", &self.is_tracking())
            .field("granularity", &state.granularity)
            .field("current_usage", &state.current_usage)
            .field("open_events", &state.event_stack.len())
            .field("completed_events", &state.completed.len())
            .finish()
    }
}

/// Closes its event on drop. Guards must be dropped in the reverse order of
/// creation, which plain scoping gives you for free.
///
/// A guard only ever closes an event of the session it was created in: after
/// `stop()` or a new `start()` it does nothing.
#[must_use = "the event is closed as soon as the guard is dropped"]
pub struct EventGuard<'a> {
    profiler: &'a UsageProfiler,
    session: Option<u64>,
}

impl<'a> EventGuard<'a> {
    fn inert(profiler: &'a UsageProfiler) -> Self {
        Self {
            profiler,
            session: None,
        }
    }

    /// Close the event now.
    pub fn finish(self) {}
}

impl Drop for EventGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.profiler.close_event(session);
        }
    }
}

impl fmt::Debug for EventGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGuard")
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    fn event<'a>(events: &'a [UsageEvent], name: &str) -> &'a UsageEvent {
        events
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("no event {name}"))
    }

    fn nested_scenario(profiler: &UsageProfiler) {
        profiler.start();
        {
            let _a = profiler.event("A");
            profiler.record(1000);
            {
                let _b = profiler.event("B");
                profiler.record(500);
            }
            profiler.record(200);
        }
        profiler.stop();
    }

    #[test]
    fn nested_events_report_peak_and_nesting() {
        let profiler = UsageProfiler::with_granularity(Duration::ZERO);
        nested_scenario(&profiler);
        assert_eq!(profiler.peak(), 1700);

        let events = profiler.completed_events();
        let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["B", "A", ROOT_EVENT]);

        let a = event(&events, "A");
        let b = event(&events, "B");
        assert_eq!((a.depth, b.depth), (1, 2));
        let (a_start, a_end) = a.span().unwrap();
        let (b_start, b_end) = b.span().unwrap();
        assert!(a_start <= b_start && b_end <= a_end);

        let b_last = *b.samples.last().unwrap();
        assert_eq!(b_last.usage, 1500);
        assert!(a.samples.contains(&b_last));
        assert_eq!(a.samples.last().unwrap().usage, 1700);
    }

    #[test]
    fn coarse_granularity_folds_samples() {
        let profiler = UsageProfiler::with_granularity(Duration::from_secs(3600));
        nested_scenario(&profiler);
        assert_eq!(profiler.peak(), 1700);

        let events = profiler.completed_events();
        let b = event(&events, "B");
        // Seed sample overwritten by the +500, then the closing sample.
        assert_eq!(b.samples.len(), 2);
        assert!(b.samples.iter().all(|s| s.usage == 1500));
    }

    #[test]
    fn samples_are_ordered_in_time() {
        let profiler = UsageProfiler::with_granularity(Duration::ZERO);
        nested_scenario(&profiler);
        for event in profiler.completed_events() {
            assert!(event.samples.windows(2).all(|w| w[0].time <= w[1].time));
        }
    }

    #[test]
    fn peak_is_zero_before_any_session() {
        let profiler = UsageProfiler::new();
        assert_eq!(profiler.peak(), 0);
        assert!(profiler.report().events.is_empty());
    }

    #[test]
    fn idle_profiler_ignores_everything() {
        let profiler = UsageProfiler::new();
        profiler.record(100);
        profiler.event("ignored").finish();
        profiler.stop();
        assert_eq!(profiler.current_usage(), 0);
        assert!(profiler.completed_events().is_empty());
    }

    #[test]
    fn start_resets_the_previous_session() {
        let profiler = UsageProfiler::new();
        nested_scenario(&profiler);
        profiler.start();
        assert_eq!(profiler.current_usage(), 0);
        assert!(profiler.completed_events().is_empty());
        profiler.stop();
        assert_eq!(profiler.peak(), 0);
    }

    #[test]
    fn stop_closes_open_events() {
        let profiler = UsageProfiler::new();
        profiler.start();
        let guard = profiler.event("open");
        profiler.record(64);
        profiler.stop();
        drop(guard);

        let events = profiler.completed_events();
        let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["open", ROOT_EVENT]);
        assert_eq!(profiler.peak(), 64);
    }

    #[test]
    fn guard_closes_on_early_return() {
        fn work(profiler: &UsageProfiler, input: &str) -> Result<(), std::num::ParseIntError> {
            let _event = profiler.event("fallible");
            profiler.record(10);
            let extra: i64 = input.parse()?;
            profiler.record(extra);
            Ok(())
        }

        let profiler = UsageProfiler::new();
        profiler.start();
        assert!(work(&profiler, "lots").is_err());
        assert_eq!(profiler.completed_events()[0].name, "fallible");
        profiler.stop();
        assert_eq!(profiler.peak(), 10);
    }

    #[test]
    fn guard_closes_on_panic() {
        let profiler = UsageProfiler::new();
        profiler.start();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            profiler.scoped("doomed", || {
                profiler.record(8);
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert_eq!(profiler.completed_events()[0].name, "doomed");

        // Still usable afterwards.
        profiler.record(8);
        profiler.stop();
        assert_eq!(profiler.peak(), 16);
    }

    #[test]
    fn stale_guard_does_not_touch_new_session() {
        let profiler = UsageProfiler::new();
        profiler.start();
        let stale = profiler.event("old");
        profiler.start();
        let _current = profiler.event("new");
        drop(stale);
        assert!(profiler.completed_events().is_empty());
        profiler.stop();

        let names: Vec<_> = profiler
            .completed_events()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["new", ROOT_EVENT]);
    }

    #[test]
    fn report_orders_by_start_time() {
        let profiler = UsageProfiler::with_granularity(Duration::ZERO);
        nested_scenario(&profiler);
        let report = profiler.report();
        assert_eq!(report.events.len(), 3);
        assert!(report
            .events
            .windows(2)
            .all(|w| w[0].span() <= w[1].span()));
        assert_eq!(report.peak, 1700);
        assert_eq!(report.granularity, Duration::ZERO);
    }

    #[test]
    fn profiler_is_shareable_across_threads() {
        let profiler = UsageProfiler::new();
        profiler.start();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        profiler.record(1);
                    }
                });
            }
        });
        assert_eq!(profiler.current_usage(), 400);
        profiler.stop();
    }
}
