//! Reconnecting TCP connect state machine.
//!
//! Drives one nonblocking connect at a time: EINPROGRESS parks the socket
//! behind a writability watch, success is verified through SO_ERROR plus a
//! self-connect check, and transient failures back off exponentially from
//! 500 ms up to 30 s until stopped.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub(crate) type NewConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

fn state_from_u8(v: u8) -> State {
    match v {
        1 => State::Connecting,
        2 => State::Connected,
        _ => State::Disconnected,
    }
}

pub(crate) struct Connector {
    loop_: LoopHandle,
    server_addr: SocketAddr,
    /// Whether the owner wants a connection at all; cleared by `stop`.
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    channel: RefCell<Option<Channel>>,
    socket: RefCell<Option<Socket>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

// SAFETY: `channel` and `socket` are only touched on the owning loop's
// thread; every method that reaches them asserts the loop thread first.
// The Arc crosses threads only to enqueue loop tasks and flip atomics.
unsafe impl Send for Connector {}
unsafe impl Sync for Connector {}

impl Connector {
    pub(crate) fn new(loop_: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new(Connector {
            loop_,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            channel: RefCell::new(None),
            socket: RefCell::new(None),
            new_connection_cb: Mutex::new(None),
        })
    }

    pub(crate) fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    fn state(&self) -> State {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Begin connecting. Callable from any thread.
    pub(crate) fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        let connector = self.clone();
        self.loop_.run_in_loop(move || connector.start_in_loop());
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.do_connect();
        } else {
            debug!("connector stopped before starting");
        }
    }

    /// Abandon the current attempt and any scheduled retry.
    pub(crate) fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        let connector = self.clone();
        self.loop_.queue_in_loop(move || connector.stop_in_loop());
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            let sock = self.detach();
            self.retry(sock);
        }
    }

    /// Reconnect from scratch with the initial backoff. Loop thread only;
    /// used by the client's close callback.
    pub(crate) fn restart(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Relaxed);
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn do_connect(self: &Arc<Self>) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(s) => s,
            // Descriptor exhaustion at socket() has no graceful recovery
            // path here; this mirrors the fatal accept errnos.
            Err(e) => panic!("socket create for {}: {e}", self.server_addr),
        };
        match socket.connect(&self.server_addr) {
            Ok(()) => self.connecting(socket),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS | libc::EINTR | libc::EISCONN) => self.connecting(socket),
                Some(
                    libc::EAGAIN
                    | libc::EADDRINUSE
                    | libc::EADDRNOTAVAIL
                    | libc::ECONNREFUSED
                    | libc::ENETUNREACH,
                ) => self.retry(Some(socket)),
                Some(
                    libc::EACCES
                    | libc::EPERM
                    | libc::EAFNOSUPPORT
                    | libc::EALREADY
                    | libc::EBADF
                    | libc::EFAULT
                    | libc::ENOTSOCK,
                ) => {
                    error!("connect to {}: {e}", self.server_addr);
                    drop(socket);
                }
                _ => {
                    error!("unexpected connect error to {}: {e}", self.server_addr);
                    drop(socket);
                }
            },
        }
    }

    /// Wait for writability to learn the connect outcome.
    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.set_state(State::Connecting);
        let channel = Channel::new(self.loop_.clone(), socket.fd());
        *self.socket.borrow_mut() = Some(socket);

        let weak = Arc::downgrade(self);
        channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            }
        });
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });
        channel.enable_writing();
        *self.channel.borrow_mut() = Some(channel);
    }

    /// Unregister the watch channel and reclaim the socket.
    fn detach(&self) -> Option<Socket> {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        self.socket.borrow_mut().take()
    }

    fn handle_write(self: &Arc<Self>) {
        trace!("connector handle_write, state {:?}", self.state());
        if self.state() != State::Connecting {
            // Spurious writability after stop.
            return;
        }
        let sock = match self.detach() {
            Some(s) => s,
            None => return,
        };
        if let Some(err) = sock.take_error() {
            warn!("connect to {} failed: {err}", self.server_addr);
            self.retry(Some(sock));
        } else if sock.is_self_connect() {
            warn!("connect to {} was a self connect", self.server_addr);
            self.retry(Some(sock));
        } else {
            self.set_state(State::Connected);
            if self.connect.load(Ordering::Acquire) {
                let cb = self.new_connection_cb.lock().clone();
                match cb {
                    Some(cb) => cb(sock),
                    None => drop(sock),
                }
            } else {
                drop(sock);
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        error!("connector error, state {:?}", self.state());
        if self.state() == State::Connecting {
            let sock = self.detach();
            if let Some(s) = &sock
                && let Some(err) = s.take_error()
            {
                error!("SO_ERROR on connect to {}: {err}", self.server_addr);
            }
            self.retry(sock);
        }
    }

    /// Close the failed socket and schedule another attempt with doubled
    /// backoff, unless stopped.
    fn retry(self: &Arc<Self>, socket: Option<Socket>) {
        drop(socket);
        self.set_state(State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::Relaxed));
            info!("connector retries {} in {:?}", self.server_addr, delay);
            let weak = Arc::downgrade(self);
            self.loop_.run_after(delay, move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            });
            let doubled = (delay * 2).min(MAX_RETRY_DELAY);
            self.retry_delay_ms
                .store(doubled.as_millis() as u64, Ordering::Relaxed);
        } else {
            debug!("connector stopped, not retrying {}", self.server_addr);
        }
    }
}
