//! Listening socket wired into a loop.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{error, trace};

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

/// Accepts connections on one listening socket and hands the descriptors to
/// its owner. Lives on the owner's (base) loop.
pub(crate) struct Acceptor {
    loop_: LoopHandle,
    socket: Socket,
    channel: Channel,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
    /// Spare descriptor parked on /dev/null so an EMFILE storm can be
    /// drained: close it, accept, close the accepted fd, reopen.
    idle_fd: Cell<RawFd>,
}

impl Acceptor {
    pub(crate) fn new(
        loop_: LoopHandle,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> Result<Rc<Acceptor>, Error> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr).map_err(|source| Error::Bind {
            addr: *listen_addr,
            source,
        })?;
        let idle_fd = open_idle_fd()?;

        let channel = Channel::new(loop_.clone(), socket.fd());
        let acceptor = Rc::new(Acceptor {
            loop_,
            socket,
            channel,
            new_connection_cb: RefCell::new(None),
            listening: Cell::new(false),
            idle_fd: Cell::new(idle_fd),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.get()
    }

    /// The bound address, with the kernel-chosen port resolved.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.listening.set(true);
        if let Err(e) = self.socket.listen(libc::SOMAXCONN) {
            panic!("listen on fd {}: {e}", self.socket.fd());
        }
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        // One accept per readable event; level triggering re-reports the
        // backlog on the next poll.
        match self.socket.accept() {
            Ok((sock, peer_addr)) => {
                let mut cb = self.new_connection_cb.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(sock, peer_addr),
                    None => drop(sock),
                }
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN)
                | Some(libc::ECONNABORTED)
                | Some(libc::EINTR)
                | Some(libc::EPROTO)
                | Some(libc::EPERM) => {
                    trace!("accept transient error: {e}");
                }
                Some(libc::EMFILE) => {
                    error!("accept: file descriptor limit reached");
                    // Give the spare descriptor back, harvest the pending
                    // connection, close it, then re-reserve the spare.
                    // Without this the listening fd stays readable forever
                    // and the loop spins hot.
                    unsafe { libc::close(self.idle_fd.get()) };
                    let fd = unsafe {
                        libc::accept(self.socket.fd(), std::ptr::null_mut(), std::ptr::null_mut())
                    };
                    if fd >= 0 {
                        unsafe { libc::close(fd) };
                    }
                    match open_idle_fd() {
                        Ok(fd) => self.idle_fd.set(fd),
                        Err(e) => error!("reopening idle fd: {e}"),
                    }
                }
                _ => panic!("accept on fd {}: {e}", self.socket.fd()),
            },
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening.get() {
            self.channel.disable_all();
            self.channel.remove();
        }
        unsafe { libc::close(self.idle_fd.get()) };
    }
}

fn open_idle_fd() -> Result<RawFd, Error> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(fd)
}
