//! Per-connection state machine and buffered I/O.
//!
//! A connection is shared as `Arc<TcpConnection>`: the server or client
//! holds the owning reference, user callbacks receive it, and the channel
//! keeps only a weak tie so event dispatch cannot outlive teardown. All
//! state transitions and buffer mutations happen on the owning loop's
//! thread; `send`, `shutdown` and `force_close` may be called from any
//! thread and trampoline into the loop.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;
use crate::time::Timestamp;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Connection lifecycle states. Transitions run in the owning loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

fn state_from_u8(v: u8) -> ConnState {
    match v {
        0 => ConnState::Connecting,
        1 => ConnState::Connected,
        2 => ConnState::Disconnecting,
        _ => ConnState::Disconnected,
    }
}

/// One established TCP connection.
pub struct TcpConnection {
    name: String,
    loop_: LoopHandle,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Channel,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

// SAFETY: the Arc is shared across threads, but every access to the
// non-Sync interior (channel, input, output) happens on the owning loop's
// thread; each such path first runs `loop_.assert_in_loop_thread()`. The
// final teardown is safe off-thread as well: `connect_destroyed` removes
// the poller's channel clone on the loop thread before the owner releases
// its reference, so by the time the last Arc drops (possibly elsewhere) the
// Rc graph inside has a single owner.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    pub(crate) fn new(
        loop_: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnection {
        let channel = Channel::new(loop_.clone(), socket.fd());
        socket.set_keep_alive(true);
        debug!("connection {name} created, fd {}", socket.fd());
        TcpConnection {
            name,
            loop_,
            state: AtomicU8::new(ConnState::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(usize::MAX),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            context: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_.clone()
    }

    pub fn state(&self) -> ConnState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    /// Arm the backpressure callback: fired from the loop when the output
    /// buffer crosses `mark` bytes upward.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.lock() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    /// Attach an embedder-owned value to this connection.
    pub fn set_context(&self, ctx: Box<dyn Any + Send>) {
        *self.context.lock() = Some(ctx);
    }

    /// Detach the embedder-owned value, if any.
    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().take()
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.socket.set_keep_alive(on);
    }

    /// Run `f` against the input buffer. Loop thread only; prefer the buffer
    /// argument of the message callback inside message dispatch.
    pub fn with_input_buffer<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        self.loop_.assert_in_loop_thread();
        f(&mut self.input.borrow_mut())
    }

    /// Run `f` against the output buffer. Loop thread only.
    pub fn with_output_buffer<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        self.loop_.assert_in_loop_thread();
        f(&mut self.output.borrow_mut())
    }

    /// Send bytes, from any thread.
    ///
    /// In the loop thread the write is attempted immediately; elsewhere the
    /// payload is copied and trampolined, so sends from any one thread are
    /// delivered in order.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.loop_.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Send and drain a caller-owned buffer.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        let data = buf.peek().to_vec();
        buf.retrieve_all();
        self.send(&data);
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        let mut nwrote: usize = 0;
        let mut remaining = data.len();
        let mut fault_error = false;

        if self.state() == ConnState::Disconnected {
            warn!("connection {} disconnected, give up writing", self.name);
            return;
        }
        // Direct write fast path: nothing queued and the writer unarmed.
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                remaining = data.len() - nwrote;
                if remaining == 0
                    && let Some(cb) = self.write_complete_callback()
                {
                    let conn = self.clone();
                    self.loop_.queue_in_loop(move || cb(&conn));
                }
            } else {
                let e = io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
                    code => {
                        error!("send to {} failed: {e}", self.name);
                        if code == Some(libc::EPIPE) || code == Some(libc::ECONNRESET) {
                            fault_error = true;
                        }
                    }
                }
            }
        }

        assert!(remaining <= data.len());
        if !fault_error && remaining > 0 {
            let old_len = self.output.borrow().readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= mark
                && old_len < mark
                && let Some(cb) = self.high_water_callback()
            {
                let conn = self.clone();
                let new_len = old_len + remaining;
                self.loop_.queue_in_loop(move || cb(&conn, new_len));
            }
            self.output.borrow_mut().append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Close the write half once the output buffer drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
        // Still writing: handle_write shuts the write half after the drain.
    }

    /// Tear the connection down without waiting for the peer.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.loop_.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Like `force_close`, after a grace period. Holds only a weak
    /// reference across the delay; a connection torn down meanwhile is left
    /// alone.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.set_state(ConnState::Disconnecting);
            let weak = Arc::downgrade(self);
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.handle_close();
        }
    }

    /// Resume delivering readable events.
    pub fn start_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_.run_in_loop(move || {
            if !conn.reading.load(Ordering::Relaxed) || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::Relaxed);
            }
        });
    }

    /// Stop delivering readable events (kernel-level backpressure).
    pub fn stop_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_.run_in_loop(move || {
            if conn.reading.load(Ordering::Relaxed) || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::Relaxed);
            }
        });
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    /// First half of the lifecycle: wire the channel, flip to Connected,
    /// tell the user. Runs on the owning loop.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let weak = Arc::downgrade(self);
        self.channel.set_read_callback({
            let weak = weak.clone();
            move |t| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(t);
                }
            }
        });
        self.channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        self.channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        self.channel.set_error_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }
        });
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();

        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
    }

    /// Last half of the lifecycle: unregister the channel. Idempotent after
    /// `handle_close`; also covers teardown of never-closed connections when
    /// the owner goes away.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_callback() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.loop_.assert_in_loop_thread();
        let result = self.input.borrow_mut().read_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(cb) = self.message_callback() {
                    cb(self, &mut self.input.borrow_mut(), receive_time);
                }
            }
            Err(e) => {
                error!("read on {} failed: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection fd {} is down, no more writing", self.channel.fd());
            return;
        }
        let n = {
            let output = self.output.borrow();
            unsafe {
                libc::write(
                    self.channel.fd(),
                    output.peek().as_ptr() as *const libc::c_void,
                    output.readable_bytes(),
                )
            }
        };
        if n > 0 {
            let drained = {
                let mut output = self.output.borrow_mut();
                output.retrieve(n as usize);
                output.readable_bytes() == 0
            };
            if drained {
                self.channel.disable_writing();
                if let Some(cb) = self.write_complete_callback() {
                    let conn = self.clone();
                    self.loop_.queue_in_loop(move || cb(&conn));
                }
                if self.state() == ConnState::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
        } else {
            error!(
                "write on {} failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        trace!("fd {} state {:?}", self.channel.fd(), self.state());
        assert!(matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ));
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        // The strong reference outlives both callbacks, so the owner's
        // close callback may drop its map entry without destroying us
        // mid-dispatch; the owner defers connect_destroyed via the loop.
        let guard: TcpConnectionPtr = self.clone();
        if let Some(cb) = self.connection_callback() {
            cb(&guard);
        }
        if let Some(cb) = self.close_callback() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Some(e) => error!("connection {} SO_ERROR: {e}", self.name),
            None => error!("connection {} error event", self.name),
        }
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.connection_cb.lock().clone()
    }

    fn message_callback(&self) -> Option<MessageCallback> {
        self.message_cb.lock().clone()
    }

    fn write_complete_callback(&self) -> Option<WriteCompleteCallback> {
        self.write_complete_cb.lock().clone()
    }

    fn high_water_callback(&self) -> Option<HighWaterMarkCallback> {
        self.high_water_cb.lock().clone()
    }

    fn close_callback(&self) -> Option<CloseCallback> {
        self.close_cb.lock().clone()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "connection {} destroyed in state {:?}",
            self.name,
            self.state()
        );
    }
}

/// Logs connection up/down. Installed when the embedder sets no
/// connection callback of its own.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards all received data. Installed when the embedder sets no message
/// callback of its own, so unread input cannot grow without bound.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Timestamp) {
    buf.retrieve_all();
}
