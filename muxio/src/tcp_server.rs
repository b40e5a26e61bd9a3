//! TCP server: acceptor, worker pool, connection registry.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use crate::socket::{self, Socket};
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
    default_connection_callback, default_message_callback,
};
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::time::Timestamp;

/// Listening socket options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Set SO_REUSEPORT so several processes can share the port.
    pub reuse_port: bool,
}

/// Registry shared with the per-connection close callbacks.
struct ServerState {
    connections: Mutex<AHashMap<String, TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
}

/// A TCP server bound to one listening address.
///
/// The server lives on its base loop's thread (it is `!Send`); new
/// connections are distributed round-robin over the worker pool, or run on
/// the base loop when the pool is empty.
pub struct TcpServer {
    loop_: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Rc<Acceptor>,
    pool: Rc<RefCell<EventLoopThreadPool>>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    thread_init_cb: Option<ThreadInitCallback>,
    started: Cell<bool>,
    state: Arc<ServerState>,
}

impl TcpServer {
    /// Bind `listen_addr` (port 0 picks an ephemeral port) on the base loop.
    pub fn new(
        base_loop: &EventLoop,
        listen_addr: &SocketAddr,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> Result<TcpServer, Error> {
        socket::ignore_sigpipe();
        let name = name.into();
        let handle = base_loop.handle();
        let acceptor = Acceptor::new(handle.clone(), listen_addr, options.reuse_port)?;
        let ip_port = acceptor
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| listen_addr.to_string());
        let pool = EventLoopThreadPool::new(handle.clone(), format!("{name}-io"));

        Ok(TcpServer {
            loop_: handle,
            name,
            ip_port,
            acceptor,
            pool: Rc::new(RefCell::new(pool)),
            connection_cb: Arc::new(default_connection_callback),
            message_cb: Arc::new(default_message_callback),
            write_complete_cb: None,
            thread_init_cb: None,
            started: Cell::new(false),
            state: Arc::new(ServerState {
                connections: Mutex::new(AHashMap::new()),
                next_conn_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The bound address, with a kernel-chosen port resolved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of worker loops. Zero (the default) runs every connection on
    /// the base loop.
    pub fn set_thread_num(&mut self, n: usize) {
        self.pool.borrow_mut().set_thread_num(n);
    }

    pub fn set_thread_init_callback(
        &mut self,
        cb: impl Fn(&LoopHandle) + Send + Sync + 'static,
    ) {
        self.thread_init_cb = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.connection_cb = Arc::new(cb);
    }

    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.message_cb = Arc::new(cb);
    }

    pub fn set_write_complete_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.write_complete_cb = Some(Arc::new(cb));
    }

    /// Live connection count, for diagnostics.
    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Start the worker pool and the acceptor. Idempotent.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started.replace(true) {
            return Ok(());
        }
        self.loop_.assert_in_loop_thread();
        self.pool.borrow_mut().start(self.thread_init_cb.clone())?;

        let ctx = NewConnectionCtx {
            base: self.loop_.clone(),
            state: self.state.clone(),
            pool: self.pool.clone(),
            name: self.name.clone(),
            ip_port: self.ip_port.clone(),
            connection_cb: self.connection_cb.clone(),
            message_cb: self.message_cb.clone(),
            write_complete_cb: self.write_complete_cb.clone(),
        };
        self.acceptor
            .set_new_connection_callback(Box::new(move |sock, peer| {
                ctx.new_connection(sock, peer)
            }));
        assert!(!self.acceptor.listening());
        self.acceptor.listen();
        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!("server {} shutting down", self.name);
        // Collect outside the lock: connect_destroyed may fire user
        // callbacks synchronously when a connection runs on the base loop.
        let connections: Vec<TcpConnectionPtr> = {
            let mut map = self.state.connections.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in connections {
            CONNECTIONS_ACTIVE.decrement();
            let io_loop = conn.loop_handle();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
        // The pool drops after this, quitting and joining each worker; the
        // destroy tasks above were queued first, so they run before exit.
    }
}

/// Everything the acceptor callback needs, detached from `TcpServer` so the
/// server can keep its own fields by value.
struct NewConnectionCtx {
    base: LoopHandle,
    state: Arc<ServerState>,
    pool: Rc<RefCell<EventLoopThreadPool>>,
    name: String,
    ip_port: String,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
}

impl NewConnectionCtx {
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.base.assert_in_loop_thread();
        let io_loop = self.pool.borrow().get_next_loop();
        let id = self.state.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "server {} accepts connection {} from {}",
            self.name, conn_name, peer_addr
        );
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("getsockname on accepted fd: {e}");
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
            }
        };
        let conn = Arc::new(TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        ));
        conn.set_connection_callback(self.connection_cb.clone());
        conn.set_message_callback(self.message_cb.clone());
        if let Some(cb) = &self.write_complete_cb {
            conn.set_write_complete_callback(cb.clone());
        }

        let base = self.base.clone();
        let state = self.state.clone();
        conn.set_close_callback(Arc::new(move |c: &TcpConnectionPtr| {
            // Runs on the connection's loop; map surgery belongs to the
            // base loop, teardown back to the connection's loop.
            let state = state.clone();
            let conn = c.clone();
            base.run_in_loop(move || {
                info!("server removes connection {}", conn.name());
                let removed = state.connections.lock().remove(conn.name());
                debug_assert!(removed.is_some());
                CONNECTIONS_ACTIVE.decrement();
                let io_loop = conn.loop_handle();
                io_loop.queue_in_loop(move || conn.connect_destroyed());
            });
        }));

        self.state.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }
}
