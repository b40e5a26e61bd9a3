//! Readiness multiplexer backends.
//!
//! The event loop talks to the kernel through the `Poller` trait; the epoll
//! backend is the default, the poll(2) backend exists for descriptors and
//! environments epoll cannot cover. The backend is a per-loop configuration
//! choice made at loop construction.

mod epoll;
mod poll;

use std::io;

use crate::channel::Channel;
use crate::time::Timestamp;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

/// Which readiness primitive a loop drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollerBackend {
    /// Level-triggered epoll. The default on Linux.
    #[default]
    Epoll,
    /// Classic poll(2) over a flat descriptor array.
    Poll,
}

/// A readiness multiplexer owned by exactly one event loop.
///
/// All methods run on the owning loop's thread. `remove_channel` is legal
/// only once the channel's interest mask is empty.
pub(crate) trait Poller {
    /// Block up to `timeout_ms` for readiness, clone each ready channel into
    /// `active` (revents filled in), and return the wakeup time.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp;

    /// Register a new channel or apply its changed interest mask.
    fn update_channel(&mut self, channel: &Channel);

    /// Drop all bookkeeping for a channel with empty interest.
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

pub(crate) fn new_poller(backend: PollerBackend) -> io::Result<Box<dyn Poller>> {
    match backend {
        PollerBackend::Epoll => Ok(Box::new(EpollPoller::new()?)),
        PollerBackend::Poll => Ok(Box::new(PollPoller::new())),
    }
}
