//! Main loop: converts the installed script into timelines at a bounded
//! cadence.
//!
//! One thread, woken by script installation and shutdown requests. While a
//! script is installed it calls the script runner every `1 / main_loop_hz`
//! seconds on the monotonic clock. The pacing arithmetic bounds both drift
//! (ticks never come early) and catch-up after a stall (at most one extra
//! tick, never a burst).
//!
//! The loop mutex guards only the installed-script slot and the shutdown
//! flag; it is released across the runner call, so an install landing
//! mid-update is simply seen on the next tick.

use std::cmp;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::clock::{Clock, MonoTime, WakeFlag};
use crate::script::Script;

/// What the main loop drives each tick. The production implementation is
/// [`ScriptRunner`]; tests substitute recorders.
///
/// [`ScriptRunner`]: crate::runner::ScriptRunner
pub trait ScriptTick: Send {
    fn tick(&mut self, script: &Script);
}

struct LoopState {
    script: Option<Arc<Script>>,
    shutdown: bool,
}

struct SharedLoop {
    state: Mutex<LoopState>,
    wake: Arc<WakeFlag>,
}

/// Control-plane face of the main loop: cloneable, cheap, thread-safe.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<SharedLoop>,
}

impl LoopHandle {
    /// Replace the installed script. The swap is a pointer exchange under
    /// the loop mutex; in-flight ticks finish against the old script.
    pub fn install_script(&self, script: Arc<Script>) {
        debug!(
            "PLAY scr={} hz={} t0={:.3}",
            script.screens.len(),
            script.main_loop_hz,
            script.zero_time.unwrap_or(0.0)
        );
        let mut state = self.shared.state.lock().unwrap();
        state.script = Some(script);
        drop(state);
        self.shared.wake.set();
    }

    pub fn request_shutdown(&self) {
        debug!("STOP");
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.shared.wake.set();
    }
}

/// The tick thread plus its shared state. Dropping requests shutdown and
/// joins the thread.
pub struct MainLoop {
    shared: Arc<SharedLoop>,
    thread: Option<JoinHandle<()>>,
}

impl MainLoop {
    pub fn start(clock: Arc<dyn Clock>, target: Arc<Mutex<dyn ScriptTick>>) -> MainLoop {
        let shared = Arc::new(SharedLoop {
            state: Mutex::new(LoopState { script: None, shutdown: false }),
            wake: WakeFlag::new(Arc::clone(&clock)),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mainloop".to_string())
                .spawn(move || loop_thread(clock, shared, target))
                .expect("Failed to spawn main loop thread")
        };

        MainLoop { shared, thread: Some(thread) }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.shared) }
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            debug!("Stopping main loop thread");
            self.handle().request_shutdown();
            let _ = thread.join();
        }
    }
}

fn loop_thread(
    clock: Arc<dyn Clock>,
    shared: Arc<SharedLoop>,
    target: Arc<Mutex<dyn ScriptTick>>,
) {
    trace!("Main loop thread running...");

    let mut last_mono = MonoTime::ZERO;
    let mut state = shared.state.lock().unwrap();
    while !state.shutdown {
        let Some(script) = state.script.clone() else {
            trace!("UPDATE (wait for script)");
            state = shared.wake.sleep_releasing(&shared.state, state);
            continue;
        };

        assert!(script.main_loop_hz > 0.0, "main_loop_hz must be positive");
        let period = Duration::from_secs_f64(1.0 / script.main_loop_hz);
        let mono = clock.now();
        if mono < last_mono + period {
            trace!("UPDATE (sleep {}ms)", ((last_mono + period) - mono).as_millis());
            let (guard, _) =
                shared.wake.sleep_until_releasing(&shared.state, state, last_mono + period);
            state = guard;
            continue;
        }

        debug!("UPDATE (mono={})", mono);
        // Clock forward one period, but never fall more than one period
        // behind now: a long stall yields one catch-up tick, not a burst.
        last_mono = cmp::max(last_mono + period, mono - period);
        drop(state);
        target.lock().unwrap().tick(&script);
        state = shared.state.lock().unwrap();
    }

    trace!("Main loop thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use crate::clock::ManualClock;
    use crate::script::parse_script;

    struct FakeTick {
        clock: Arc<ManualClock>,
        ticks: Arc<StdMutex<Vec<MonoTime>>>,
    }

    impl ScriptTick for FakeTick {
        fn tick(&mut self, _script: &Script) {
            self.ticks.lock().unwrap().push(self.clock.now());
        }
    }

    fn setup(clock: &Arc<ManualClock>) -> (MainLoop, Arc<StdMutex<Vec<MonoTime>>>) {
        let ticks = Arc::new(StdMutex::new(Vec::new()));
        let target: Arc<Mutex<dyn ScriptTick>> = Arc::new(Mutex::new(FakeTick {
            clock: clock.clone(),
            ticks: Arc::clone(&ticks),
        }));
        (MainLoop::start(clock.clone(), target), ticks)
    }

    fn script(hz: f64) -> Arc<Script> {
        Arc::new(parse_script(&format!(r#"{{"main_loop_hz": {}}}"#, hz), 0.0).unwrap())
    }

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

    /// Test: no installed script
    /// Validates: the loop idles however far the clock moves
    #[test]
    fn test_no_script_idles() {
        let clock = ManualClock::new();
        let (_main_loop, ticks) = setup(&clock);

        clock.advance_millis(10_000);
        thread::sleep(Duration::from_millis(30));
        assert!(ticks.lock().unwrap().is_empty());
    }

    /// Test: steady pacing at the scripted rate
    /// Validates: ticks land one period apart, never early
    #[test]
    fn test_paced_ticks() {
        let clock = ManualClock::new();
        let (main_loop, ticks) = setup(&clock);
        main_loop.handle().install_script(script(10.0));

        clock.advance_millis(100);
        wait_for("first tick", || ticks.lock().unwrap().len() == 1);

        clock.advance_millis(50);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.lock().unwrap().len(), 1, "ticked early");

        clock.advance_millis(50);
        wait_for("second tick", || ticks.lock().unwrap().len() == 2);

        let recorded = ticks.lock().unwrap().clone();
        assert_eq!(recorded, vec![MonoTime::from_millis(100), MonoTime::from_millis(200)]);
    }

    /// Test: a long stall
    /// Validates: catch-up bounded to one extra tick, no burst
    #[test]
    fn test_bounded_catchup() {
        let clock = ManualClock::new();
        let (main_loop, ticks) = setup(&clock);
        main_loop.handle().install_script(script(10.0));

        clock.advance_millis(100);
        wait_for("first tick", || ticks.lock().unwrap().len() == 1);

        // Ten periods pass at once; only one catch-up tick follows the
        // regular one.
        clock.advance_millis(1000);
        wait_for("catch-up", || ticks.lock().unwrap().len() == 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.lock().unwrap().len(), 3, "tick burst after stall");

        // Pacing resumes one period after the stall position.
        clock.advance_millis(100);
        wait_for("resumed tick", || ticks.lock().unwrap().len() == 4);
        assert_eq!(*ticks.lock().unwrap().last().unwrap(), MonoTime::from_millis(1200));
    }

    /// Test: shutdown during the inter-tick sleep
    /// Validates: prompt join, no further ticks
    #[test]
    fn test_shutdown_mid_sleep() {
        let clock = ManualClock::new();
        let (main_loop, ticks) = setup(&clock);
        main_loop.handle().install_script(script(1.0)); // 1s period
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        drop(main_loop);
        assert!(start.elapsed() < Duration::from_secs(1), "drop did not return promptly");

        clock.advance_millis(5000);
        thread::sleep(Duration::from_millis(30));
        assert!(ticks.lock().unwrap().is_empty());
    }

    /// Test: replacing the script mid-flight
    /// Validates: the new rate takes over within one old period
    #[test]
    fn test_reinstall_changes_rate() {
        let clock = ManualClock::new();
        let (main_loop, ticks) = setup(&clock);
        main_loop.handle().install_script(script(10.0));

        clock.advance_millis(100);
        wait_for("first tick", || ticks.lock().unwrap().len() == 1);

        main_loop.handle().install_script(script(100.0)); // 10ms period
        clock.advance_millis(10);
        wait_for("fast tick", || ticks.lock().unwrap().len() == 2);
        assert_eq!(*ticks.lock().unwrap().last().unwrap(), MonoTime::from_millis(110));
    }
}
