//! poll(2) backend.

use std::io;
use std::os::fd::RawFd;

use ahash::AHashMap;
use tracing::{error, trace};

use super::Poller;
use crate::channel::{Channel, INDEX_NEW};
use crate::time::Timestamp;

pub(crate) struct PollPoller {
    /// One entry per registered channel; a channel's index field is its slot
    /// here. A disabled entry stores `-fd - 1` so the kernel ignores it
    /// without the slot being reused.
    pollfds: Vec<libc::pollfd>,
    channels: AHashMap<RawFd, Channel>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: AHashMap::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n < 0 {
            if saved.raw_os_error() != Some(libc::EINTR) {
                error!("poll: {saved}");
            }
            return now;
        }
        if n > 0 {
            trace!("{n} events ready");
        }
        let mut left = n;
        for pfd in &self.pollfds {
            if left <= 0 {
                break;
            }
            if pfd.revents > 0 {
                left -= 1;
                // Negative fds are disabled slots; the kernel leaves their
                // revents at zero, so reaching here means pfd.fd is real.
                if let Some(channel) = self.channels.get(&pfd.fd) {
                    channel.set_revents(pfd.revents as u16 as u32);
                    active.push(channel.clone());
                }
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("update fd {fd} events {}", channel.events());

        if channel.index() < 0 {
            debug_assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events() as i16,
                revents: 0,
            });
            channel.set_index((self.pollfds.len() - 1) as i32);
            self.channels.insert(fd, channel.clone());
        } else {
            debug_assert!(
                self.channels
                    .get(&fd)
                    .is_some_and(|c| c.same_channel(channel))
            );
            let idx = channel.index() as usize;
            debug_assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            pfd.fd = if channel.is_none_event() { -fd - 1 } else { fd };
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
        let idx = channel.index() as usize;
        debug_assert!(idx < self.pollfds.len());

        self.channels.remove(&fd);
        let last = self.pollfds.len() - 1;
        if idx != last {
            self.pollfds.swap(idx, last);
            let moved_fd = self.pollfds[idx].fd;
            let moved_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(idx as i32);
            }
        }
        self.pollfds.pop();
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| c.same_channel(channel))
    }
}
