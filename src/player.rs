//! Per-connector playback thread: drives hardware scan-out from a timeline.
//!
//! Each connector gets one [`FramePlayer`]. The owning thread picks the atom
//! whose deadline is the greatest at or before "now", submits it as an atomic
//! page flip, and sleeps until the next deadline or an external wakeup.
//! Deadlines the thread had to jump over are accounted as skips so
//! `last_shown` stays monotone and misses are visible in the logs.
//!
//! # Locking
//!
//! All mutable state sits behind one mutex. The thread holds it except while
//! sleeping and while calling into the driver; the atom to submit is cloned
//! out under the lock first.
//!
//! # Failure
//!
//! Driver errors are fatal: the thread reports a [`PlayerFault`] on the
//! supervision channel and exits. Late frames are warnings, not faults.
//! A pending page flip is transient; the thread re-polls after 5 ms.

use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};

use crate::clock::{Clock, MonoTime, WakeFlag};
use crate::display::{DisplayDriver, DisplayMode, DriverError};
use crate::timeline::{same_keys, Timeline};

/// Re-poll interval while a previous page flip is still in flight.
const BUSY_POLL: Duration = Duration::from_millis(5);

/// Fatal fault escaped from a player thread. The supervisor turns this into
/// process termination.
#[derive(Debug)]
pub struct PlayerFault {
    pub connector_id: u32,
    pub error: DriverError,
}

/// Control-plane handle to one per-connector playback thread.
///
/// Dropping the handle stops the thread: the shutdown flag is set, the
/// thread is woken and joined, and no driver calls happen after drop
/// returns.
pub trait FramePlayer: Send {
    /// Replace the whole timeline. Takes effect atomically; wakes the thread
    /// only when the deadline schedule actually changed.
    fn set_timeline(&self, timeline: Timeline);

    /// Deadline of the most recently shown or skipped atom; zero before any.
    fn last_shown(&self) -> MonoTime;
}

struct PlayerState {
    timeline: Timeline,
    shown: MonoTime,
    shutdown: bool,
}

struct ThreadFramePlayer {
    state: Arc<Mutex<PlayerState>>,
    wake: Arc<WakeFlag>,
    thread: Option<JoinHandle<()>>,
}

impl FramePlayer for ThreadFramePlayer {
    fn set_timeline(&self, timeline: Timeline) {
        let mut state = self.state.lock().unwrap();
        let unchanged = same_keys(&timeline, &state.timeline);

        if log::log_enabled!(log::Level::Trace) {
            match (timeline.keys().next(), timeline.keys().next_back()) {
                (Some(first), Some(last)) => trace!(
                    "Set timeline {}f {}~{} {}",
                    timeline.len(),
                    first,
                    last,
                    if unchanged { "[same]" } else { "[diff]" }
                ),
                _ => trace!("Set timeline empty"),
            }
        }

        state.timeline = timeline;
        let wake_needed = !state.timeline.is_empty() && !unchanged;
        drop(state);
        if wake_needed {
            self.wake.set();
        }
    }

    fn last_shown(&self) -> MonoTime {
        self.state.lock().unwrap().shown
    }
}

impl Drop for ThreadFramePlayer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            debug!("Stopping frame player...");
            self.state.lock().unwrap().shutdown = true;
            self.wake.set();
            let _ = thread.join();
        }
    }
}

/// Launch a playback thread owning `connector_id` in `mode`.
pub fn start_frame_player(
    clock: Arc<dyn Clock>,
    driver: Arc<dyn DisplayDriver>,
    connector_id: u32,
    mode: DisplayMode,
    fault_tx: Sender<PlayerFault>,
) -> Box<dyn FramePlayer> {
    info!("Launching frame player for connector {} ({})", connector_id, mode);
    let state = Arc::new(Mutex::new(PlayerState {
        timeline: Timeline::new(),
        shown: MonoTime::ZERO,
        shutdown: false,
    }));
    let wake = WakeFlag::new(Arc::clone(&clock));

    let thread = {
        let state = Arc::clone(&state);
        let wake = Arc::clone(&wake);
        thread::Builder::new()
            .name(format!("player-{}", connector_id))
            .spawn(move || {
                player_thread(clock, driver, connector_id, mode, state, wake, fault_tx)
            })
            .expect("Failed to spawn player thread")
    };

    Box::new(ThreadFramePlayer { state, wake, thread: Some(thread) })
}

fn player_thread(
    clock: Arc<dyn Clock>,
    driver: Arc<dyn DisplayDriver>,
    connector_id: u32,
    mode: DisplayMode,
    shared: Arc<Mutex<PlayerState>>,
    wake: Arc<WakeFlag>,
    fault_tx: Sender<PlayerFault>,
) {
    debug!("Frame player thread running...");

    let fatal = |error: DriverError| {
        error!("Display fault on connector {}: {}", connector_id, error);
        let _ = fault_tx.send(PlayerFault { connector_id, error });
    };

    let mut state = shared.lock().unwrap();
    while !state.shutdown {
        if state.timeline.is_empty() {
            trace!("PLAY (no frames, waiting for wakeup)");
            state = wake.sleep_releasing(&shared, state);
            continue;
        }

        let now = clock.now();

        // The atom currently in force: the greatest deadline at or before
        // now, unless that one was already shown, in which case the first
        // future deadline (if any).
        let show = match state.timeline.range(..=now).next_back() {
            Some((&key, atom)) if key > state.shown => Some((key, atom.clone())),
            _ => state
                .timeline
                .range((Bound::Excluded(now), Bound::Unbounded))
                .next()
                .map(|(&key, atom)| (key, atom.clone())),
        };

        // Deadlines passed over on the way to the chosen atom are missed
        // frames: advance `shown` through each so it stays monotone and the
        // misses are observable.
        if let Some((show_key, _)) = &show {
            let skipped: Vec<MonoTime> = state
                .timeline
                .range((Bound::Excluded(state.shown), Bound::Excluded(*show_key)))
                .map(|(&key, _)| key)
                .collect();
            for key in skipped {
                warn!("Skip frame sched={} ({}ms old)", key, (now - key).as_millis());
                state.shown = key;
            }
        }

        let Some((show_key, atom)) = show else {
            trace!("PLAY (no more frames, waiting for wakeup)");
            state = wake.sleep_releasing(&shared, state);
            continue;
        };

        if show_key > now {
            trace!("PLAY (waiting {}ms for frame)", (show_key - now).as_millis());
            let (guard, _) = wake.sleep_until_releasing(&shared, state, show_key);
            state = guard;
            continue;
        }

        // Hardware gate and submission run with the state lock released.
        drop(state);
        match driver.update_done_yet(connector_id) {
            Ok(true) => {}
            Ok(false) => {
                trace!("PLAY (update pending, waiting 5ms)");
                wake.sleep_until(now + BUSY_POLL);
                state = shared.lock().unwrap();
                continue;
            }
            Err(error) => {
                fatal(error);
                return;
            }
        }
        if let Err(error) = driver.update(connector_id, &mode, &atom) {
            fatal(error);
            return;
        }

        state = shared.lock().unwrap();
        state.shown = show_key;
        debug!("Show frame sched={} ({}ms old)", show_key, (now - show_key).as_millis());
    }

    debug!("Frame player thread ending...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use crossbeam_channel::unbounded;

    use crate::clock::ManualClock;
    use crate::display::{DisplayAtom, DisplayLayer, Frame, Rect, Screen};

    const MODE: DisplayMode = DisplayMode { width: 1920, height: 1080, hz: 60 };

    /// Driver double that records submissions with their fake-clock instants
    /// and replays a scripted sequence of update_done_yet answers (defaults
    /// to ready once the script runs out).
    struct FakeDriver {
        clock: Arc<ManualClock>,
        updates: StdMutex<Vec<(MonoTime, String)>>,
        done_script: StdMutex<VecDeque<bool>>,
        fail_update: bool,
    }

    impl FakeDriver {
        fn new(clock: Arc<ManualClock>) -> Arc<FakeDriver> {
            Arc::new(FakeDriver {
                clock,
                updates: StdMutex::new(Vec::new()),
                done_script: StdMutex::new(VecDeque::new()),
                fail_update: false,
            })
        }

        fn script_done(&self, answers: &[bool]) {
            self.done_script.lock().unwrap().extend(answers.iter().copied());
        }

        fn submitted(&self) -> Vec<(MonoTime, String)> {
            self.updates.lock().unwrap().clone()
        }

        fn tags(&self) -> Vec<String> {
            self.submitted().into_iter().map(|(_, tag)| tag).collect()
        }
    }

    impl DisplayDriver for FakeDriver {
        fn scan_screens(&self) -> Result<Vec<Screen>, DriverError> {
            Ok(Vec::new())
        }

        fn update(
            &self,
            connector_id: u32,
            _mode: &DisplayMode,
            atom: &DisplayAtom,
        ) -> Result<(), DriverError> {
            if self.fail_update {
                return Err(DriverError::UnknownConnector(connector_id));
            }
            let tag = atom
                .layers
                .first()
                .map(|l| l.frame.source().to_string())
                .unwrap_or_default();
            self.updates.lock().unwrap().push((self.clock.now(), tag));
            Ok(())
        }

        fn update_done_yet(&self, _connector_id: u32) -> Result<bool, DriverError> {
            Ok(self.done_script.lock().unwrap().pop_front().unwrap_or(true))
        }
    }

    fn atom(tag: &str) -> DisplayAtom {
        DisplayAtom {
            layers: vec![DisplayLayer {
                frame: Frame::new(1920, 1080, tag, 0.0),
                from: Rect::new(0.0, 0.0, 1920.0, 1080.0),
                to: Rect::new(0.0, 0.0, 1920.0, 1080.0),
                opacity: 1.0,
            }],
        }
    }

    fn timeline(entries: &[(u64, &str)]) -> Timeline {
        entries
            .iter()
            .map(|&(ms, tag)| (MonoTime::from_millis(ms), atom(tag)))
            .collect()
    }

    /// Poll until `cond` holds, failing after a generous real-time budget.
    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "timed out waiting for: {}",
                what
            );
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn start(
        clock: &Arc<ManualClock>,
        driver: &Arc<FakeDriver>,
    ) -> (Box<dyn FramePlayer>, crossbeam_channel::Receiver<PlayerFault>) {
        let (fault_tx, fault_rx) = unbounded();
        let player = start_frame_player(
            clock.clone(),
            driver.clone() as Arc<dyn DisplayDriver>,
            1,
            MODE,
            fault_tx,
        );
        (player, fault_rx)
    }

    /// Test: single frame submitted exactly at its deadline
    /// Validates: on-time path, last_shown, no skips
    #[test]
    fn test_single_frame_on_time() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(100, "A")]));
        clock.advance_millis(100);

        wait_for("one submission", || driver.submitted().len() == 1);
        let (at, tag) = driver.submitted().remove(0);
        assert_eq!(tag, "A");
        assert_eq!(at, MonoTime::from_millis(100));
        assert_eq!(player.last_shown(), MonoTime::from_millis(100));
    }

    /// Test: clock jumps past earlier deadlines
    /// Validates: only the newest due atom is submitted, misses advance shown
    #[test]
    fn test_skip_past_frames() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10, "A"), (20, "B"), (30, "C")]));
        clock.advance_millis(25);

        wait_for("B submitted", || driver.tags() == vec!["B".to_string()]);
        assert_eq!(player.last_shown(), MonoTime::from_millis(20));

        clock.advance_millis(10); // t = 35
        wait_for("C submitted", || driver.tags().len() == 2);
        assert_eq!(driver.tags(), vec!["B".to_string(), "C".to_string()]);
        assert_eq!(player.last_shown(), MonoTime::from_millis(30));
    }

    /// Test: future-only timeline
    /// Validates: no submission before the deadline, one at it
    #[test]
    fn test_future_frame_waits() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(1000, "A")]));

        clock.advance_millis(500);
        thread::sleep(Duration::from_millis(30));
        assert!(driver.submitted().is_empty(), "submitted before deadline");

        clock.advance_millis(500);
        wait_for("A submitted", || driver.submitted().len() == 1);
        assert_eq!(player.last_shown(), MonoTime::from_millis(1000));
    }

    /// Test: replacement with identical keys swaps atoms in place
    /// Validates: updated atoms are shown, stale ones are not
    #[test]
    fn test_replace_same_keys_uses_new_atoms() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(100, "A"), (200, "B")]));
        clock.advance_millis(50);
        thread::sleep(Duration::from_millis(30));
        player.set_timeline(timeline(&[(100, "A2"), (200, "B2")]));

        clock.advance_millis(50); // t = 100
        wait_for("A2 submitted", || driver.tags() == vec!["A2".to_string()]);

        clock.advance_millis(100); // t = 200
        wait_for("B2 submitted", || driver.tags().len() == 2);
        assert_eq!(driver.tags(), vec!["A2".to_string(), "B2".to_string()]);
    }

    /// Test: pending page flip delays submission by the 5ms re-poll
    /// Validates: hardware backpressure path
    #[test]
    fn test_hardware_busy_repolls() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        driver.script_done(&[false]);
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(100, "A")]));
        clock.advance_millis(100);

        // First poll sees the flip pending; nothing may be submitted yet.
        thread::sleep(Duration::from_millis(30));
        assert!(driver.submitted().is_empty());

        clock.advance_millis(5);
        wait_for("A submitted after re-poll", || driver.submitted().len() == 1);
        let (at, _) = driver.submitted().remove(0);
        assert_eq!(at, MonoTime::from_millis(105));
        assert_eq!(player.last_shown(), MonoTime::from_millis(100));
    }

    /// Test: permanently busy hardware
    /// Validates: no update call, shown never advances
    #[test]
    fn test_busy_forever_never_submits() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        driver.script_done(&[false; 64]);
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10, "A")]));
        for _ in 0..20 {
            clock.advance_millis(5);
            thread::sleep(Duration::from_millis(5));
        }

        assert!(driver.submitted().is_empty());
        assert_eq!(player.last_shown(), MonoTime::ZERO);
    }

    /// Test: drop during a long deadline wait
    /// Validates: prompt join, no submission afterwards
    #[test]
    fn test_shutdown_during_wait() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10_000, "A")]));
        clock.advance_millis(5);
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        drop(player);
        assert!(start.elapsed() < Duration::from_secs(1), "drop did not return promptly");
        assert!(driver.submitted().is_empty());
    }

    /// Test: timeline entirely in the past
    /// Validates: latest atom submitted, all earlier ones skipped
    #[test]
    fn test_all_past_submits_latest() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        clock.advance_millis(500);
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10, "A"), (20, "B"), (30, "C")]));

        wait_for("C submitted", || driver.tags() == vec!["C".to_string()]);
        assert_eq!(player.last_shown(), MonoTime::from_millis(30));
    }

    /// Test: emptied timeline goes idle
    /// Validates: no further submissions until a non-empty timeline arrives
    #[test]
    fn test_empty_timeline_idles() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10, "A")]));
        clock.advance_millis(10);
        wait_for("A submitted", || driver.submitted().len() == 1);

        player.set_timeline(Timeline::new());
        clock.advance_millis(1000);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(driver.submitted().len(), 1);

        // Recovery: a fresh timeline resumes playback.
        player.set_timeline(timeline(&[(2000, "B")]));
        clock.advance_millis(1000);
        wait_for("B submitted", || driver.submitted().len() == 2);
    }

    /// Test: driver failure on update
    /// Validates: fault reported, thread exits, drop still returns
    #[test]
    fn test_driver_error_reports_fault() {
        let clock = ManualClock::new();
        let mut driver = FakeDriver::new(clock.clone());
        Arc::get_mut(&mut driver).unwrap().fail_update = true;
        let (player, faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10, "A")]));
        clock.advance_millis(10);

        let fault = faults.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fault.connector_id, 1);
        drop(player);
    }

    /// Test: last_shown monotonicity across jumps and replacements
    /// Validates: shown never decreases
    #[test]
    fn test_last_shown_monotone() {
        let clock = ManualClock::new();
        let driver = FakeDriver::new(clock.clone());
        let (player, _faults) = start(&clock, &driver);

        player.set_timeline(timeline(&[(10, "A"), (20, "B")]));
        clock.advance_millis(25);
        wait_for("B shown", || player.last_shown() == MonoTime::from_millis(20));

        // Replacement whose keys are all older than shown must not regress it.
        player.set_timeline(timeline(&[(5, "old")]));
        clock.advance_millis(5);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(player.last_shown(), MonoTime::from_millis(20));
        assert_eq!(driver.tags(), vec!["B".to_string()]);
    }
}
