//! Per-descriptor dispatch record.
//!
//! A Channel binds one file descriptor to its interest mask, the readiness
//! the poller last reported, and the callbacks that consume that readiness.
//! It never owns the descriptor and it is pinned to one event loop for its
//! whole life; every mutator runs on that loop's thread.

use std::any::Any;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use tracing::{trace, warn};

use crate::event_loop::{LoopCore, LoopHandle};
use crate::time::Timestamp;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::POLLOUT as u32;

const HUP: u32 = libc::POLLHUP as u32;
const ERR: u32 = libc::POLLERR as u32;
const NVAL: u32 = libc::POLLNVAL as u32;
const RDHUP: u32 = libc::POLLRDHUP as u32;
const IN: u32 = libc::POLLIN as u32;
const PRI: u32 = libc::POLLPRI as u32;
const OUT: u32 = libc::POLLOUT as u32;

/// Poller bookkeeping slot for a channel the poller has never seen.
pub(crate) const INDEX_NEW: i32 = -1;

type ReadCallback = Rc<dyn Fn(Timestamp)>;
type EventCallback = Rc<dyn Fn()>;

struct Inner {
    loop_: LoopHandle,
    fd: RawFd,
    events: u32,
    revents: u32,
    /// Poller bookkeeping: registration state for epoll, slot index for poll.
    index: i32,
    log_hup: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,
    added_to_loop: bool,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling);
        debug_assert!(!self.added_to_loop);
    }
}

/// Cheaply cloneable handle to a per-descriptor dispatch record.
///
/// Clones share the same record; the poller holds one clone per registered
/// descriptor and the owning object (connection, acceptor, timer queue,
/// wakeup reader) holds another. Embedders with a custom descriptor (a
/// signalfd, an inotify fd) build a Channel on it, set callbacks, and
/// enable interest; the Channel never owns or closes the descriptor.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<Inner>>,
}

impl Channel {
    pub fn new(loop_: LoopHandle, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                loop_,
                fd,
                events: NONE_EVENT,
                revents: NONE_EVENT,
                index: INDEX_NEW,
                log_hup: true,
                tie: None,
                event_handling: false,
                added_to_loop: false,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            })),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.inner.borrow().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.borrow_mut().revents = revents;
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.inner.borrow().events == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.inner.borrow().events & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.inner.borrow().events & WRITE_EVENT != 0
    }

    pub(crate) fn index(&self) -> i32 {
        self.inner.borrow().index
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.inner.borrow_mut().index = index;
    }

    pub(crate) fn same_channel(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_read_callback(&self, cb: impl Fn(Timestamp) + 'static) {
        self.inner.borrow_mut().read_cb = Some(Rc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        self.inner.borrow_mut().write_cb = Some(Rc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + 'static) {
        self.inner.borrow_mut().close_cb = Some(Rc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + 'static) {
        self.inner.borrow_mut().error_cb = Some(Rc::new(cb));
    }

    /// Gate event dispatch on the lifetime of `owner`.
    ///
    /// The weak reference is upgraded at the top of every dispatch; if the
    /// owner is already gone the whole batch of events is dropped. This is
    /// the only mechanism that makes dispatch safe across the owner's
    /// teardown.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.inner.borrow_mut().tie = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(&self) {
        self.inner.borrow_mut().events |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.borrow_mut().events &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.borrow_mut().events |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.borrow_mut().events &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.borrow_mut().events = NONE_EVENT;
        self.update();
    }

    fn update(&self) {
        self.inner.borrow_mut().added_to_loop = true;
        self.with_loop(|core| core.update_channel(self));
    }

    /// Unregister from the poller. Interest must already be empty.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        if !self.inner.borrow().added_to_loop {
            return;
        }
        self.inner.borrow_mut().added_to_loop = false;
        self.with_loop(|core| core.remove_channel(self));
    }

    fn with_loop<R>(&self, f: impl FnOnce(&Rc<LoopCore>) -> R) -> R {
        let handle = self.inner.borrow().loop_.clone();
        handle.assert_in_loop_thread();
        let core =
            LoopCore::current().expect("channel mutated outside any running event loop thread");
        debug_assert!(core.is_handle(&handle));
        f(&core)
    }

    /// Dispatch the readiness the poller reported, in fixed priority order.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.inner.borrow().tie.clone();
        let _guard;
        if let Some(weak) = tie {
            match weak.upgrade() {
                Some(owner) => _guard = owner,
                // Owner already destroyed: drop the whole event batch.
                None => return,
            }
        }
        self.handle_event_with_guard(receive_time);
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let (fd, revents, log_hup, read_cb, write_cb, close_cb, error_cb) = {
            let inner = self.inner.borrow();
            (
                inner.fd,
                inner.revents,
                inner.log_hup,
                inner.read_cb.clone(),
                inner.write_cb.clone(),
                inner.close_cb.clone(),
                inner.error_cb.clone(),
            )
        };
        self.inner.borrow_mut().event_handling = true;
        trace!("fd {} dispatching {}", fd, events_to_string(revents));

        if revents & HUP != 0 && revents & IN == 0 {
            if log_hup {
                warn!("fd {} POLLHUP", fd);
            }
            if let Some(cb) = &close_cb {
                cb();
            }
        }
        if revents & NVAL != 0 {
            warn!("fd {} POLLNVAL", fd);
        }
        if revents & (ERR | NVAL) != 0 {
            if let Some(cb) = &error_cb {
                cb();
            }
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            if let Some(cb) = &read_cb {
                cb(receive_time);
            }
        }
        if revents & OUT != 0 {
            if let Some(cb) = &write_cb {
                cb();
            }
        }
        self.inner.borrow_mut().event_handling = false;
    }
}

fn events_to_string(ev: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (IN, "IN"),
        (PRI, "PRI"),
        (OUT, "OUT"),
        (HUP, "HUP"),
        (RDHUP, "RDHUP"),
        (ERR, "ERR"),
        (NVAL, "NVAL"),
    ] {
        if ev & bit != 0 {
            let _ = write!(out, "{name} ");
        }
    }
    out
}
