//! Wall-clock trigger for the scheduled digests.
//!
//! The trigger is a small state machine polled once per tick:
//!
//! ```text
//! Idle --(HH:MM matches an entry)--> Firing --(job done)--> PostFireHold
//!   ^                                                           |
//!   +-----------------(fired minute is over)--------------------+
//!
//! any waiting state --(stop signal)--> Stopped
//! ```
//!
//! `PostFireHold` remembers the minute that fired, so a poll landing in that
//! same minute never fires it twice. The stop signal is only observed while
//! waiting; a running job always completes.

use crate::config::ConfigError;
use crate::models::{MAX_HOURS_BACK, MIN_HOURS_BACK};
use crate::utils::local_now;
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime, Timelike};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

/// Longest wait between polls. Every wait is also cut at the next minute
/// boundary, so each wall-clock minute is polled at least once.
pub const TICK: Duration = Duration::from_secs(60);

/// One row of the schedule table: at `time_of_day`, harvest `hours_back` hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub time_of_day: NaiveTime,
    pub hours_back: u32,
}

impl ScheduleEntry {
    /// Parse a `"HH:MM" -> hours` row.
    pub fn parse(time: &str, hours_back: u32) -> Result<Self, ConfigError> {
        let time_of_day = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map_err(|_| ConfigError::BadScheduleTime(time.to_string()))?;
        if !(MIN_HOURS_BACK..=MAX_HOURS_BACK).contains(&hours_back) {
            return Err(ConfigError::HoursOutOfRange {
                time: time.to_string(),
                hours: hours_back,
            });
        }
        Ok(Self {
            time_of_day,
            hours_back,
        })
    }

    /// Same hour and minute as `now`; seconds are ignored.
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        now.hour() == self.time_of_day.hour() && now.minute() == self.time_of_day.minute()
    }
}

/// Work run when an entry fires.
pub trait ScheduledJob: Send + Sync {
    fn run(&self, hours_back: u32) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Firing {
        entry: ScheduleEntry,
        minute: NaiveDateTime,
    },
    PostFireHold {
        minute: NaiveDateTime,
    },
    Stopped,
}

#[derive(Debug)]
pub struct ScheduleTrigger {
    entries: Vec<ScheduleEntry>,
    state: TriggerState,
    tick: Duration,
    clock: fn() -> NaiveDateTime,
}

fn minute_of(now: NaiveDateTime) -> NaiveDateTime {
    now - ChronoDuration::seconds(i64::from(now.second()))
        - ChronoDuration::nanoseconds(i64::from(now.nanosecond()))
}

impl ScheduleTrigger {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self {
            entries,
            state: TriggerState::Idle,
            tick: TICK,
            clock: local_now,
        }
    }

    /// Replace the wall clock the trigger compares entries against.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Advance the machine for a tick at `now`. Returns the entry to fire, if any.
    pub fn poll(&mut self, now: NaiveDateTime) -> Option<ScheduleEntry> {
        match self.state {
            TriggerState::Stopped | TriggerState::Firing { .. } => None,
            TriggerState::PostFireHold { minute } if minute == minute_of(now) => {
                debug!(%now, "Still inside the fired minute; holding");
                None
            }
            TriggerState::PostFireHold { .. } | TriggerState::Idle => {
                self.state = TriggerState::Idle;
                let entry = *self.entries.iter().find(|e| e.matches(now))?;
                self.state = TriggerState::Firing {
                    entry,
                    minute: minute_of(now),
                };
                Some(entry)
            }
        }
    }

    /// The job for the current firing has completed.
    pub fn finish(&mut self) {
        if let TriggerState::Firing { minute, .. } = self.state {
            self.state = TriggerState::PostFireHold { minute };
        }
    }

    /// Time left in the held minute, as seen at `now`.
    pub fn hold_remaining(&self, now: NaiveDateTime) -> Duration {
        match self.state {
            TriggerState::PostFireHold { minute } => (minute + ChronoDuration::minutes(1) - now)
                .to_std()
                .unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    /// How long to sleep before the next poll at `now`: one tick, or less if
    /// the next minute starts sooner.
    pub fn next_wait(&self, now: NaiveDateTime) -> Duration {
        let next_minute = minute_of(now) + ChronoDuration::minutes(1);
        (next_minute - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.tick)
    }

    /// Leave `PostFireHold` once the held minute is over.
    pub fn release(&mut self) {
        if matches!(self.state, TriggerState::PostFireHold { .. }) {
            self.state = TriggerState::Idle;
        }
    }

    /// Drive the machine against the local wall clock until `stop` turns true.
    #[instrument(level = "info", skip_all, fields(entries = self.entries.len()))]
    pub async fn run<J: ScheduledJob>(&mut self, job: &J, mut stop: watch::Receiver<bool>) {
        info!(tick_secs = self.tick.as_secs(), "Schedule trigger started");
        loop {
            if *stop.borrow_and_update() {
                break;
            }

            if let Some(entry) = self.poll((self.clock)()) {
                info!(
                    time = %entry.time_of_day.format("%H:%M"),
                    hours_back = entry.hours_back,
                    "Scheduled run firing"
                );
                job.run(entry.hours_back).await;
                self.finish();

                let hold = self.hold_remaining((self.clock)());
                debug!(hold_ms = hold.as_millis() as u64, "Holding until the fired minute ends");
                if !hold.is_zero() && wait_or_stop(&mut stop, hold).await {
                    break;
                }
                self.release();
                // The next minute may have its own entry.
                continue;
            }

            let wait = self.next_wait((self.clock)());
            if wait_or_stop(&mut stop, wait).await {
                break;
            }
        }
        self.state = TriggerState::Stopped;
        info!("Schedule trigger stopped");
    }
}

/// Sleep for `duration`. Returns `true` early if a stop is signalled.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    let sleeper = sleep(duration);
    tokio::pin!(sleeper);
    loop {
        tokio::select! {
            _ = &mut sleeper => return false,
            changed = stop.changed() => match changed {
                Ok(()) if *stop.borrow_and_update() => return true,
                Ok(()) => continue,
                Err(_) => {
                    // Sender is gone; nobody can stop us any more.
                    (&mut sleeper).await;
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::cell::Cell;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn entries() -> Vec<ScheduleEntry> {
        vec![
            ScheduleEntry::parse("08:00", 14).unwrap(),
            ScheduleEntry::parse("14:00", 6).unwrap(),
            ScheduleEntry::parse("18:00", 4).unwrap(),
        ]
    }

    #[test]
    fn test_parse_entry() {
        let entry = ScheduleEntry::parse("8:05", 3).unwrap();
        assert_eq!(entry.time_of_day, NaiveTime::from_hms_opt(8, 5, 0).unwrap());
        assert!(ScheduleEntry::parse("25:00", 3).is_err());
        assert!(ScheduleEntry::parse("08:00", 0).is_err());
    }

    #[test]
    fn test_fires_only_on_exact_minute() {
        let mut trigger = ScheduleTrigger::new(entries());
        assert_eq!(trigger.poll(at(7, 59, 59)), None);
        assert_eq!(trigger.state(), TriggerState::Idle);

        let fired = trigger.poll(at(8, 0, 30)).unwrap();
        assert_eq!(fired.hours_back, 14);
        assert!(matches!(trigger.state(), TriggerState::Firing { .. }));
    }

    #[test]
    fn test_hold_prevents_double_fire_in_same_minute() {
        let mut trigger = ScheduleTrigger::new(entries());
        assert!(trigger.poll(at(14, 0, 5)).is_some());
        trigger.finish();
        assert_eq!(
            trigger.state(),
            TriggerState::PostFireHold { minute: at(14, 0, 0) }
        );
        assert_eq!(trigger.poll(at(14, 0, 59)), None);
        assert_eq!(trigger.hold_remaining(at(14, 0, 45)), Duration::from_secs(15));

        assert_eq!(trigger.poll(at(14, 1, 5)), None);
        assert_eq!(trigger.state(), TriggerState::Idle);
    }

    #[test]
    fn test_same_time_next_day_fires_again() {
        let mut trigger = ScheduleTrigger::new(entries());
        assert!(trigger.poll(at(18, 0, 0)).is_some());
        trigger.finish();
        let next_day = at(18, 0, 10) + ChronoDuration::days(1);
        assert_eq!(trigger.poll(next_day).map(|e| e.hours_back), Some(4));
    }

    #[test]
    fn test_hold_remaining_is_zero_after_long_job() {
        let mut trigger = ScheduleTrigger::new(entries());
        assert!(trigger.poll(at(8, 0, 0)).is_some());
        trigger.finish();
        assert_eq!(trigger.hold_remaining(at(8, 3, 0)), Duration::ZERO);
        trigger.release();
        assert_eq!(trigger.state(), TriggerState::Idle);
    }

    #[test]
    fn test_next_wait_is_cut_at_minute_boundary() {
        let trigger = ScheduleTrigger::new(entries());
        assert_eq!(trigger.next_wait(at(8, 0, 45)), Duration::from_secs(15));
        assert_eq!(trigger.next_wait(at(8, 0, 0)), Duration::from_secs(60));

        let fast = ScheduleTrigger::new(entries()).with_tick(Duration::from_secs(5));
        assert_eq!(fast.next_wait(at(8, 0, 45)), Duration::from_secs(5));
        assert_eq!(fast.next_wait(at(8, 0, 58)), Duration::from_secs(2));
    }

    /// Runs until it has been called `stop_after` times, then signals stop.
    struct CountingJob {
        runs: AtomicUsize,
        hours: Mutex<Vec<u32>>,
        stop_after: usize,
        stop: watch::Sender<bool>,
    }

    impl CountingJob {
        fn new(stop_after: usize, stop: watch::Sender<bool>) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                hours: Mutex::new(Vec::new()),
                stop_after,
                stop,
            }
        }
    }

    impl ScheduledJob for CountingJob {
        async fn run(&self, hours_back: u32) {
            self.hours.lock().unwrap().push(hours_back);
            if self.runs.fetch_add(1, Ordering::SeqCst) + 1 >= self.stop_after {
                let _ = self.stop.send(true);
            }
        }
    }

    thread_local! {
        static CLOCK_ORIGIN: Cell<Option<(tokio::time::Instant, NaiveDateTime)>> =
            const { Cell::new(None) };
    }

    /// Start a wall clock that reads `at` now and follows tokio's (paused) time.
    fn start_clock(at: NaiveDateTime) {
        CLOCK_ORIGIN.with(|o| o.set(Some((tokio::time::Instant::now(), at))));
    }

    fn tokio_clock() -> NaiveDateTime {
        let (started, at) = CLOCK_ORIGIN
            .with(Cell::get)
            .expect("start_clock must be called first");
        at + ChronoDuration::from_std(started.elapsed()).unwrap()
    }

    fn entry(time: &str, hours_back: u32) -> ScheduleEntry {
        ScheduleEntry::parse(time, hours_back).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_in_consecutive_minutes_both_fire() {
        start_clock(at(8, 0, 30));
        let (tx, rx) = watch::channel(false);
        let job = CountingJob::new(2, tx);
        let mut trigger = ScheduleTrigger::new(vec![entry("08:00", 14), entry("08:01", 3)])
            .with_clock(tokio_clock);

        tokio::time::timeout(Duration::from_secs(600), trigger.run(&job, rx))
            .await
            .expect("both entries should fire");
        assert_eq!(*job.hours.lock().unwrap(), vec![14, 3]);
        assert!(tokio_clock() < at(8, 2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_minute_skipped_when_started_just_before_boundary() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_milli_opt(7, 59, 59, 999)
            .unwrap();
        start_clock(start);
        let (tx, rx) = watch::channel(false);
        let job = CountingJob::new(3, tx);
        let mut trigger = ScheduleTrigger::new(vec![
            entry("08:00", 1),
            entry("08:01", 2),
            entry("08:02", 3),
        ])
        .with_clock(tokio_clock);

        tokio::time::timeout(Duration::from_secs(600), trigger.run(&job, rx))
            .await
            .expect("every minute should be polled");
        assert_eq!(*job.hours.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(trigger.state(), TriggerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_polls_land_on_every_minute() {
        start_clock(at(9, 17, 42));
        let (tx, rx) = watch::channel(false);
        let job = CountingJob::new(1, tx);
        let mut trigger = ScheduleTrigger::new(vec![entry("10:05", 5)]).with_clock(tokio_clock);

        tokio::time::timeout(Duration::from_secs(2 * 60 * 60), trigger.run(&job, rx))
            .await
            .expect("the entry should fire");
        assert_eq!(*job.hours.lock().unwrap(), vec![5]);
        assert!(tokio_clock() >= at(10, 5, 0) && tokio_clock() < at(10, 6, 0));
    }

    #[tokio::test]
    async fn test_run_stops_immediately_when_already_signalled() {
        let (tx, rx) = watch::channel(true);
        let job = CountingJob::new(1, tx);
        let mut trigger = ScheduleTrigger::new(entries());
        trigger.run(&job, rx).await;
        assert_eq!(trigger.state(), TriggerState::Stopped);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_fires_then_honours_stop_during_hold() {
        let now = local_now();
        let schedule = [now, now + ChronoDuration::minutes(1)]
            .iter()
            .map(|t| ScheduleEntry {
                time_of_day: NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap(),
                hours_back: 2,
            })
            .collect();

        let (tx, rx) = watch::channel(false);
        let job = CountingJob::new(1, tx);
        let mut trigger = ScheduleTrigger::new(schedule);
        tokio::time::timeout(Duration::from_secs(5), trigger.run(&job, rx))
            .await
            .expect("trigger should stop once the job signals");
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert_eq!(trigger.state(), TriggerState::Stopped);
    }
}
