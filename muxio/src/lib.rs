//! Multi-threaded TCP reactor for Linux.
//!
//! One event loop per thread, multiplexing readiness from epoll or poll(2),
//! driving a timerfd-backed timer queue, and taking cross-thread work
//! through an eventfd wakeup. On top of the reactor: a TCP server that
//! round-robins connections over a pool of worker loops, and a TCP client
//! with reconnect and backoff.
//!
//! The concurrency contract is simple and strict: everything loop-owned
//! runs in its loop's thread, and touching it from anywhere else panics.
//! The only cross-thread entry points are [`LoopHandle`]'s task and timer
//! injection, plus `send`/`shutdown`/`force_close` on a connection, which
//! trampoline into the loop.

mod acceptor;
pub mod buffer;
mod channel;
mod connector;
mod error;
mod event_loop;
pub mod logging;
pub mod metrics;
mod poller;
mod socket;
mod tcp_client;
mod tcp_connection;
mod tcp_server;
mod thread_pool;
mod time;
mod timer;

pub use buffer::Buffer;
pub use channel::Channel;
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::PollerBackend;
pub use tcp_client::TcpClient;
pub use tcp_connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback, default_connection_callback,
    default_message_callback,
};
pub use tcp_server::{ServerOptions, TcpServer};
pub use thread_pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use time::Timestamp;
pub use timer::TimerId;
