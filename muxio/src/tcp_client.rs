//! TCP client: a connector bound to at most one live connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer::Buffer;
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::socket::{self, Socket};
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
    default_connection_callback, default_message_callback,
};
use crate::time::Timestamp;

struct ClientState {
    connection: Mutex<Option<TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
}

/// A reconnecting TCP client with at most one live connection.
///
/// `connect` may be called from any thread holding the client; the
/// connection itself lives on the loop named at construction.
pub struct TcpClient {
    loop_: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    retry: Arc<AtomicBool>,
    connect: Arc<AtomicBool>,
    state: Arc<ClientState>,
}

impl TcpClient {
    pub fn new(loop_: LoopHandle, server_addr: SocketAddr, name: impl Into<String>) -> TcpClient {
        socket::ignore_sigpipe();
        TcpClient {
            connector: Connector::new(loop_.clone(), server_addr),
            loop_,
            name: name.into(),
            connection_cb: Arc::new(default_connection_callback),
            message_cb: Arc::new(default_message_callback),
            write_complete_cb: None,
            retry: Arc::new(AtomicBool::new(false)),
            connect: Arc::new(AtomicBool::new(false)),
            state: Arc::new(ClientState {
                connection: Mutex::new(None),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// Reconnect automatically when an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// The live connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.state.connection.lock().clone()
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

    /// Start connecting. Set the callbacks before calling this; they are
    /// bound to the connection attempt here.
    pub fn connect(&mut self) {
        info!(
            "client {} connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::Release);

        let ctx = NewConnectionCtx {
            loop_: self.loop_.clone(),
            state: self.state.clone(),
            name: self.name.clone(),
            connection_cb: self.connection_cb.clone(),
            message_cb: self.message_cb.clone(),
            write_complete_cb: self.write_complete_cb.clone(),
            retry: self.retry.clone(),
            connect: self.connect.clone(),
            connector: Arc::downgrade(&self.connector),
        };
        self.connector
            .set_new_connection_callback(Arc::new(move |sock| ctx.new_connection(sock)));
        self.connector.start();
    }

    /// Shut down the live connection's write half, if any.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.state.connection.lock().clone() {
            conn.shutdown();
        }
    }

    /// Cancel connecting (and any scheduled retry).
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.connect.store(false, Ordering::Release);
        let conn = self.state.connection.lock().clone();
        match conn {
            Some(conn) => {
                // The close path keeps working after the client is gone:
                // everything it captures is reference counted.
                conn.force_close();
            }
            None => self.connector.stop(),
        }
    }
}

/// Everything the connector callback needs, detached from `TcpClient`.
struct NewConnectionCtx {
    loop_: LoopHandle,
    state: Arc<ClientState>,
    name: String,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    retry: Arc<AtomicBool>,
    connect: Arc<AtomicBool>,
    connector: std::sync::Weak<Connector>,
}

impl NewConnectionCtx {
    fn new_connection(&self, socket: Socket) {
        self.loop_.assert_in_loop_thread();
        let unspecified = || SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        let peer_addr = socket.peer_addr().unwrap_or_else(|e| {
            warn!("getpeername on connected fd: {e}");
            unspecified()
        });
        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            warn!("getsockname on connected fd: {e}");
            unspecified()
        });
        let id = self.state.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = Arc::new(TcpConnection::new(
            self.loop_.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        ));
        conn.set_connection_callback(self.connection_cb.clone());
        conn.set_message_callback(self.message_cb.clone());
        if let Some(cb) = &self.write_complete_cb {
            conn.set_write_complete_callback(cb.clone());
        }

        let loop_ = self.loop_.clone();
        let state = self.state.clone();
        let retry = self.retry.clone();
        let connect = self.connect.clone();
        let connector = self.connector.clone();
        let client_name = self.name.clone();
        conn.set_close_callback(Arc::new(move |c: &TcpConnectionPtr| {
            // Runs on the client's loop thread.
            loop_.assert_in_loop_thread();
            state.connection.lock().take();
            let conn = c.clone();
            loop_.queue_in_loop(move || conn.connect_destroyed());

            if retry.load(Ordering::Acquire) && connect.load(Ordering::Acquire) {
                info!("client {client_name} reconnecting to {}", c.peer_addr());
                if let Some(connector) = connector.upgrade() {
                    connector.restart();
                }
            }
        }));

        *self.state.connection.lock() = Some(conn.clone());
        conn.connect_established();
    }
}
