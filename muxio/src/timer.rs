//! Timer queue driven by a kernel timer descriptor.
//!
//! All timers of a loop share one timerfd, always armed for the earliest
//! expiration. Two parallel containers index the same timers: an ordered map
//! keyed by (expiration, sequence) for earliest-first extraction, and a
//! sequence-keyed map for cancellation lookup. Their sizes are equal at
//! every observable point.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use tracing::{error, trace};

use crate::channel::Channel;
use crate::event_loop::{LoopCore, LoopHandle};
use crate::metrics::TIMERS_FIRED;
use crate::time::{MICROS_PER_SECOND, Timestamp};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Handle identifying a scheduled timer.
///
/// Sequences are globally monotonic and never reused, so a `TimerId` stays
/// unambiguous after its timer has fired and been freed; cancelling a dead
/// timer is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    seq: u64,
}

/// A single scheduled callback.
pub(crate) struct Timer {
    seq: u64,
    when: Cell<Timestamp>,
    interval: Duration,
    cb: RefCell<Box<dyn FnMut() + Send>>,
}

impl Timer {
    pub(crate) fn new<F>(when: Timestamp, interval: Duration, cb: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        Timer {
            seq: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            when: Cell::new(when),
            interval,
            cb: RefCell::new(Box::new(cb)),
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId { seq: self.seq }
    }

    fn repeat(&self) -> bool {
        self.interval > Duration::ZERO
    }

    fn expiration(&self) -> Timestamp {
        self.when.get()
    }

    fn restart(&self, now: Timestamp) {
        self.when.set(now + self.interval);
    }

    fn run(&self) {
        TIMERS_FIRED.increment();
        (self.cb.borrow_mut())();
    }
}

type Entry = ((Timestamp, u64), Rc<Timer>);

/// Ordered set of timers behind one timerfd. Loop-confined; cross-thread
/// callers reach it through `LoopHandle::run_at` and friends.
pub(crate) struct TimerQueue {
    timerfd: OwnedFd,
    channel: Channel,
    /// Earliest-first, ties broken by sequence.
    timers: RefCell<BTreeMap<(Timestamp, u64), Rc<Timer>>>,
    /// Cancellation lookup by sequence.
    active: RefCell<AHashMap<u64, Rc<Timer>>>,
    calling_expired: Cell<bool>,
    /// Sequences cancelled while their own callbacks were running; `reset`
    /// drops these instead of rescheduling.
    canceling: RefCell<AHashSet<u64>>,
}

impl TimerQueue {
    pub(crate) fn new(handle: LoopHandle) -> io::Result<TimerQueue> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let timerfd = unsafe { OwnedFd::from_raw_fd(fd) };
        let channel = Channel::new(handle, timerfd.as_raw_fd());
        channel.set_read_callback(move |_| {
            if let Some(core) = LoopCore::current() {
                core.timers.handle_read();
            }
        });
        Ok(TimerQueue {
            timerfd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(AHashMap::new()),
            calling_expired: Cell::new(false),
            canceling: RefCell::new(AHashSet::new()),
        })
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Unregister the timerfd channel. Called by the loop's destructor while
    /// the thread-local loop slot is still populated.
    pub(crate) fn shutdown(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }

    pub(crate) fn add_timer_in_loop(&self, timer: Rc<Timer>) {
        let when = timer.expiration();
        if self.insert(timer) {
            self.reset_timerfd(when);
        }
    }

    pub(crate) fn cancel_in_loop(&self, id: TimerId) {
        self.check_sets();
        let found = self.active.borrow_mut().remove(&id.seq);
        if let Some(timer) = found {
            let removed = self
                .timers
                .borrow_mut()
                .remove(&(timer.expiration(), id.seq));
            debug_assert!(removed.is_some());
        } else if self.calling_expired.get() {
            self.canceling.borrow_mut().insert(id.seq);
        }
        self.check_sets();
    }

    fn handle_read(&self) {
        let now = Timestamp::now();
        self.read_timerfd(now);

        let expired = self.get_expired(now);

        self.calling_expired.set(true);
        self.canceling.borrow_mut().clear();
        for (_, timer) in &expired {
            timer.run();
        }
        self.calling_expired.set(false);

        self.reset(expired, now);
    }

    /// Extract every timer with expiration <= now, earliest first.
    fn get_expired(&self, now: Timestamp) -> Vec<Entry> {
        self.check_sets();
        let expired: Vec<Entry> = {
            let mut timers = self.timers.borrow_mut();
            // The sentinel's sequence component is above any real sequence,
            // so entries at exactly `now` are extracted too.
            let unexpired = timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *timers, unexpired)
                .into_iter()
                .collect()
        };
        {
            let mut active = self.active.borrow_mut();
            for ((_, seq), _) in &expired {
                let removed = active.remove(seq);
                debug_assert!(removed.is_some());
            }
        }
        self.check_sets();
        expired
    }

    /// Reschedule periodic survivors and reprogram the timerfd.
    fn reset(&self, expired: Vec<Entry>, now: Timestamp) {
        for ((_, seq), timer) in expired {
            if timer.repeat() && !self.canceling.borrow().contains(&seq) {
                timer.restart(now);
                self.insert(timer);
            }
            // One-shots and mid-fire cancellations drop here.
        }
        let next = self.timers.borrow().keys().next().map(|k| k.0);
        match next {
            Some(when) => self.reset_timerfd(when),
            // Disarm explicitly; a stale armed value would produce a
            // spurious wakeup with nothing to run.
            None => self.disarm_timerfd(),
        }
    }

    fn insert(&self, timer: Rc<Timer>) -> bool {
        self.check_sets();
        let when = timer.expiration();
        let seq = timer.seq;
        let earliest_changed = {
            let mut timers = self.timers.borrow_mut();
            let earliest_changed = timers.keys().next().is_none_or(|k| when < k.0);
            let prev = timers.insert((when, seq), timer.clone());
            debug_assert!(prev.is_none());
            earliest_changed
        };
        let prev = self.active.borrow_mut().insert(seq, timer);
        debug_assert!(prev.is_none());
        self.check_sets();
        earliest_changed
    }

    fn read_timerfd(&self, now: Timestamp) {
        let mut howmany: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timerfd.as_raw_fd(),
                &mut howmany as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        trace!("timer queue handles {howmany} expirations at {now}");
        if n != 8 {
            error!("timerfd read returns {n} bytes instead of 8");
        }
    }

    fn reset_timerfd(&self, expiration: Timestamp) {
        let mut new_value: libc::itimerspec = unsafe { std::mem::zeroed() };
        new_value.it_value = how_much_time_from_now(expiration);
        let ret = unsafe {
            libc::timerfd_settime(
                self.timerfd.as_raw_fd(),
                0,
                &new_value,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            // Logged and ignored: the queue re-arms on the next insert.
            error!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }

    fn disarm_timerfd(&self) {
        let new_value: libc::itimerspec = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::timerfd_settime(
                self.timerfd.as_raw_fd(),
                0,
                &new_value,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            error!("timerfd_settime (disarm): {}", io::Error::last_os_error());
        }
    }

    fn check_sets(&self) {
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
    }
}

/// Relative delay until `when`, floored at 100 microseconds: an interval of
/// zero would disarm the timerfd instead of firing it.
fn how_much_time_from_now(when: Timestamp) -> libc::timespec {
    let mut micros = when.micros() - Timestamp::now().micros();
    if micros < 100 {
        micros = 100;
    }
    libc::timespec {
        tv_sec: (micros / MICROS_PER_SECOND) as libc::time_t,
        tv_nsec: ((micros % MICROS_PER_SECOND) * 1000) as libc::c_long,
    }
}
