//! One event loop per thread.
//!
//! An `EventLoop` owns a poller, a timer queue, and an eventfd used to rouse
//! the loop from other threads. The loop is bound to the thread that
//! constructs it and is deliberately `!Send`; everything loop-owned is
//! mutated only on that thread, asserted at every entry point.
//!
//! Cross-thread access goes through [`LoopHandle`], which exposes exactly
//! the operations that are legal from any thread: task injection, timers,
//! wakeup, and quit.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::channel::Channel;
use crate::error::Error;
use crate::metrics::WAKEUPS;
use crate::poller::{self, Poller, PollerBackend};
use crate::time::Timestamp;
use crate::timer::{Timer, TimerId, TimerQueue};

/// Ceiling on a single poll: the loop always wakes at least this often.
const POLL_TIMEOUT_MS: i32 = 10_000;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

/// State shared between the loop thread and every handle.
pub(crate) struct LoopShared {
    tid: ThreadId,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    wakeup_fd: OwnedFd,
}

/// The cross-thread surface of an event loop.
///
/// Handles are cheap to clone and safe to hold after the loop has exited;
/// tasks queued to a dead loop are simply never run.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread is the loop's thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.tid
    }

    /// Panic unless called on the loop's thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop-owned state touched off its loop thread: owner {:?}, current {:?} ({:?})",
                self.shared.tid,
                thread::current().id(),
                thread::current().name()
            );
        }
    }

    /// Run `task` in the loop thread: synchronously when already there,
    /// otherwise enqueued behind the current poll iteration.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` to run after the current poll batch.
    ///
    /// A wakeup is written when the caller is off-thread, and also when the
    /// loop is currently draining its pending queue; without the second
    /// condition a task enqueued from inside a pending task would sit until
    /// the next unrelated poll return.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Number of tasks waiting in the pending queue.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Ask the loop to exit after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `cb` once at `when`.
    pub fn run_at<F>(&self, when: Timestamp, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(when, Duration::ZERO, cb)
    }

    /// Run `cb` once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(Timestamp::now() + delay, Duration::ZERO, cb)
    }

    /// Run `cb` every `interval`, starting one interval from now.
    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        assert!(interval > Duration::ZERO);
        self.schedule(Timestamp::now() + interval, interval, cb)
    }

    /// Cancel a timer. A no-op if it already fired (one-shot) or the loop is
    /// gone.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(core) = LoopCore::current() {
                core.timers.cancel_in_loop(id);
            }
        });
    }

    fn schedule<F>(&self, when: Timestamp, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(when, interval, cb);
        let id = timer.id();
        self.run_in_loop(move || {
            let core = LoopCore::current().expect("timer scheduled onto a dead event loop");
            core.timers.add_timer_in_loop(Rc::new(timer));
        });
        id
    }

    /// Rouse the loop out of its poll.
    pub(crate) fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup writes {n} bytes instead of 8");
        }
        WAKEUPS.increment();
    }
}

/// Loop-private state, reachable on the loop thread via the thread-local
/// current-loop slot.
pub(crate) struct LoopCore {
    shared: Arc<LoopShared>,
    poller: RefCell<Box<dyn Poller>>,
    pub(crate) timers: TimerQueue,
    wakeup_channel: Channel,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    poll_return_time: Cell<Timestamp>,
    iteration: Cell<u64>,
}

impl LoopCore {
    /// The loop registered on the calling thread, if any.
    pub(crate) fn current() -> Option<Rc<LoopCore>> {
        CURRENT_LOOP.with(|cur| cur.borrow().clone())
    }

    pub(crate) fn is_handle(&self, handle: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &handle.shared)
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            thread::current().id() == self.shared.tid,
            "loop-owned state touched off its loop thread"
        );
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    fn do_pending_functors(&self) {
        // The flag must cover the whole drain so queue_in_loop from inside a
        // task still writes a wakeup; the swap keeps the lock out of task
        // execution entirely.
        self.shared.calling_pending.store(true, Ordering::Release);
        let functors = std::mem::take(&mut *self.shared.pending.lock());
        for f in functors {
            f();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

/// A reactor bound to the constructing thread.
///
/// At most one `EventLoop` may exist per thread; constructing a second one
/// panics. The loop is `!Send`; share a [`LoopHandle`] instead.
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    /// Create a loop on this thread with the default (epoll) backend.
    pub fn new() -> Result<EventLoop, Error> {
        Self::with_backend(PollerBackend::default())
    }

    /// Create a loop on this thread with an explicit poller backend.
    pub fn with_backend(backend: PollerBackend) -> Result<EventLoop, Error> {
        CURRENT_LOOP.with(|cur| {
            if cur.borrow().is_some() {
                panic!(
                    "another EventLoop already exists in thread {:?} ({:?})",
                    thread::current().id(),
                    thread::current().name()
                );
            }
        });

        let wakeup_fd = new_eventfd()?;
        let shared = Arc::new(LoopShared {
            tid: thread::current().id(),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            wakeup_fd,
        });
        let handle = LoopHandle {
            shared: shared.clone(),
        };

        let poller = poller::new_poller(backend)?;
        let timers = TimerQueue::new(handle.clone())?;
        let wakeup_channel = Channel::new(handle.clone(), shared.wakeup_fd.as_raw_fd());
        {
            let shared = shared.clone();
            wakeup_channel.set_read_callback(move |_| {
                let mut buf: u64 = 0;
                let n = unsafe {
                    libc::read(
                        shared.wakeup_fd.as_raw_fd(),
                        &mut buf as *mut u64 as *mut libc::c_void,
                        8,
                    )
                };
                if n != 8 {
                    error!("wakeup read returns {n} bytes instead of 8");
                }
            });
        }

        let core = Rc::new(LoopCore {
            shared,
            poller: RefCell::new(poller),
            timers,
            wakeup_channel,
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            poll_return_time: Cell::new(Timestamp::default()),
            iteration: Cell::new(0),
        });
        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Some(core.clone()));

        // Registration needs the thread-local slot populated, so the
        // always-on channels are armed last.
        core.wakeup_channel.enable_reading();
        core.timers.channel().enable_reading();

        trace!("event loop created in {:?}", thread::current().id());
        Ok(EventLoop { core })
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.core.shared.clone(),
        }
    }

    /// Run the loop until [`LoopHandle::quit`] is called.
    ///
    /// Each iteration polls with a 10 s ceiling, dispatches ready channels
    /// in the order the poller returned them, then drains pending tasks in
    /// enqueue order.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.core.looping.get(), "event loop already running");
        let core = &self.core;
        core.looping.set(true);
        // quit is one-way: a quit that lands between construction and run()
        // must not be lost, so the flag is never reset here.
        trace!("event loop starts");

        let mut active: Vec<Channel> = Vec::new();
        while !core.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = core
                .poller
                .borrow_mut()
                .poll(POLL_TIMEOUT_MS, &mut active);
            core.poll_return_time.set(receive_time);
            core.iteration.set(core.iteration.get() + 1);

            core.event_handling.set(true);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            core.event_handling.set(false);

            core.do_pending_functors();
        }

        trace!("event loop stops");
        core.looping.set(false);
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.core.shared.tid
    }

    pub fn assert_in_loop_thread(&self) {
        self.handle().assert_in_loop_thread();
    }

    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().run_in_loop(task);
    }

    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().queue_in_loop(task);
    }

    pub fn run_at<F>(&self, when: Timestamp, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_at(when, cb)
    }

    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_after(delay, cb)
    }

    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_every(interval, cb)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }

    /// Whether `channel` is registered with this loop's poller.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.core.has_channel(channel)
    }

    /// The timestamp of the most recent poll return.
    pub fn poll_return_time(&self) -> Timestamp {
        self.core.poll_return_time.get()
    }

    /// Completed loop iterations.
    pub fn iteration(&self) -> u64 {
        self.core.iteration.get()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        trace!("event loop destroyed in {:?}", thread::current().id());
        self.core.timers.shutdown();
        self.core.wakeup_channel.disable_all();
        self.core.wakeup_channel.remove();
        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = None);
    }
}

fn new_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
