//! Level-triggered epoll backend.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ahash::AHashMap;
use tracing::{error, trace};

use super::Poller;
use crate::channel::{Channel, INDEX_NEW};
use crate::time::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Channel is registered with the kernel.
const INDEX_ADDED: i32 = 1;
/// Channel's interest was cleared; it stays in the fd map so re-enabling is
/// an ADD without re-inserting.
const INDEX_DELETED: i32 = 2;

pub(crate) struct EpollPoller {
    epfd: OwnedFd,
    /// Kernel-filled event array. Doubles when a poll fills it completely,
    /// never shrinks below the initial 16.
    events: Vec<libc::epoll_event>,
    channels: AHashMap<RawFd, Channel>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![zeroed_event(); INIT_EVENT_LIST_SIZE],
            channels: AHashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) } < 0 {
            let e = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd {fd}: {e}");
            } else {
                panic!("epoll_ctl op {op} fd {fd}: {e}");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n < 0 {
            if saved.raw_os_error() != Some(libc::EINTR) {
                error!("epoll_wait: {saved}");
            }
            return now;
        }
        let n = n as usize;
        if n > 0 {
            trace!("{n} events ready");
        }
        for ev in &self.events[..n] {
            let fd = ev.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(ev.events);
                active.push(channel.clone());
            }
        }
        if n == self.events.len() {
            let doubled = self.events.len() * 2;
            self.events.resize(doubled, zeroed_event());
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let index = channel.index();
        let fd = channel.fd();
        trace!("update fd {fd} events {} index {index}", channel.events());

        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(
                    self.channels
                        .get(&fd)
                        .is_some_and(|c| c.same_channel(channel))
                );
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert!(
                self.channels
                    .get(&fd)
                    .is_some_and(|c| c.same_channel(channel))
            );
            debug_assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        debug_assert!(
            self.channels
                .get(&fd)
                .is_some_and(|c| c.same_channel(channel))
        );
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(index == INDEX_ADDED || index == INDEX_DELETED);

        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| c.same_channel(channel))
    }
}

fn zeroed_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}
