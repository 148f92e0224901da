//! Monotonic time and the interruptible wait primitive.
//!
//! Everything that schedules in this crate runs off a [`Clock`]: the frame
//! players pick submission instants with it, the main loop paces ticks with
//! it, and the virtual display backend uses it to simulate vsync. The
//! production clock reads [`Instant`]; [`ManualClock`] is advanced by hand so
//! the scheduler can be driven deterministically in tests.
//!
//! [`WakeFlag`] is the only blocking primitive the playback threads use: a
//! deadline-bounded wait that another thread can cut short with `set()`.

use std::cmp;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic timestamp, measured from an arbitrary per-process epoch.
///
/// Totally ordered, so it serves directly as a `BTreeMap` key in timelines.
/// The zero value doubles as the "nothing shown yet" sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonoTime(Duration);

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        MonoTime(Duration::from_millis(ms))
    }

    /// Seconds from the epoch, clamping negatives to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        MonoTime(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.as_nanos()
    }

    pub fn from_nanos(nanos: u128) -> Self {
        // Duration::new takes u64 secs; split to stay in range.
        let secs = (nanos / 1_000_000_000) as u64;
        let rem = (nanos % 1_000_000_000) as u32;
        MonoTime(Duration::new(secs, rem))
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0 + rhs)
    }
}

/// Saturating difference: an earlier minus a later time is zero, never a panic.
impl Sub<MonoTime> for MonoTime {
    type Output = Duration;

    fn sub(self, rhs: MonoTime) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0.saturating_sub(rhs))
    }
}

impl fmt::Display for MonoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

/// Time source shared by the scheduler threads.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic time. Never jumps backward.
    fn now(&self) -> MonoTime;

    /// Wall-clock seconds since the Unix epoch. Used only to anchor script
    /// `zero_time`; never used for scheduling.
    fn real(&self) -> f64;

    /// Called when a [`WakeFlag`] binds to this clock. Test clocks use the
    /// hook to poke sleepers whenever time is advanced; the system clock has
    /// no need for it.
    fn attach(&self, _flag: &Arc<WakeFlag>) {}
}

/// Production clock: `Instant` for monotonic reads, `SystemTime` for real.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(SystemClock { epoch: Instant::now() })
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.epoch.elapsed())
    }

    fn real(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Manually advanced clock for tests and simulation.
///
/// `advance` moves monotonic and real time together and pokes every attached
/// [`WakeFlag`], so a thread parked in `sleep_until` re-checks the new time
/// immediately instead of waiting out a wall-clock timeout. The poke is a
/// spurious wakeup as far as sleepers are concerned; they re-check their
/// predicates as the contract requires.
pub struct ManualClock {
    now: Mutex<MonoTime>,
    real_epoch: f64,
    flags: Mutex<Vec<Weak<WakeFlag>>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock {
            now: Mutex::new(MonoTime::ZERO),
            real_epoch: 0.0,
            flags: Mutex::new(Vec::new()),
        })
    }

    pub fn advance(&self, by: Duration) {
        {
            let mut now = self.now.lock().unwrap();
            *now = *now + by;
        }
        let mut flags = self.flags.lock().unwrap();
        flags.retain(|weak| match weak.upgrade() {
            Some(flag) => {
                flag.poke();
                true
            }
            None => false,
        });
    }

    pub fn advance_millis(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoTime {
        *self.now.lock().unwrap()
    }

    fn real(&self) -> f64 {
        self.real_epoch + self.now().as_secs_f64()
    }

    fn attach(&self, flag: &Arc<WakeFlag>) {
        self.flags.lock().unwrap().push(Arc::downgrade(flag));
    }
}

/// What ended a `sleep_until`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// Another thread called `set`.
    Woken,
    /// The deadline passed on the bound clock.
    Expired,
}

/// One-shot wakeup token bound to a clock.
///
/// `set` is idempotent: if nothing is sleeping, the token is consumed by the
/// next `sleep*` call, which then returns immediately once. The token lives
/// under the flag's own mutex, so a `set` that races a thread between
/// releasing its state lock and parking is never lost.
pub struct WakeFlag {
    clock: Arc<dyn Clock>,
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeFlag {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<WakeFlag> {
        let flag = Arc::new(WakeFlag {
            clock: Arc::clone(&clock),
            pending: Mutex::new(false),
            cond: Condvar::new(),
        });
        clock.attach(&flag);
        flag
    }

    /// Wake the sleeper, or arm the token if nobody is sleeping.
    pub fn set(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_all();
    }

    /// Wake any current sleeper without leaving a token behind. Sleepers see
    /// a spurious wakeup and re-check their predicates.
    pub(crate) fn poke(&self) {
        let _pending = self.pending.lock().unwrap();
        self.cond.notify_all();
    }

    /// Block until `set` is called.
    pub fn sleep(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            pending = self.cond.wait(pending).unwrap();
        }
        *pending = false;
    }

    /// Block until the bound clock reaches `deadline` or `set` is called,
    /// whichever comes first.
    pub fn sleep_until(&self, deadline: MonoTime) -> WakeReason {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if *pending {
                *pending = false;
                return WakeReason::Woken;
            }
            let now = self.clock.now();
            if now >= deadline {
                return WakeReason::Expired;
            }
            // With a manual clock the timeout is nominal; advance() pokes the
            // condvar and the loop re-reads the clock.
            let (guard, _timeout) = self
                .cond
                .wait_timeout(pending, cmp::max(deadline - now, Duration::from_millis(1)))
                .unwrap();
            pending = guard;
        }
    }

    /// Release `guard`, sleep until `set`, then re-lock `lock` before
    /// returning.
    pub fn sleep_releasing<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        drop(guard);
        self.sleep();
        lock.lock().unwrap()
    }

    /// Release `guard`, sleep until `deadline` or `set`, then re-lock `lock`.
    pub fn sleep_until_releasing<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        deadline: MonoTime,
    ) -> (MutexGuard<'a, T>, WakeReason) {
        drop(guard);
        let reason = self.sleep_until(deadline);
        (lock.lock().unwrap(), reason)
    }
}
