use std::net::SocketAddr;

use muxio::{EventLoop, ServerOptions, TcpServer};

fn main() {
    muxio::logging::init("info");

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .expect("listen address");
    let threads: usize = std::env::args()
        .nth(2)
        .map(|s| s.parse().expect("thread count"))
        .unwrap_or(1);

    let event_loop = EventLoop::new().expect("event loop");
    let mut server = TcpServer::new(&event_loop, &addr, "echo", ServerOptions::default())
        .expect("failed to bind");
    server.set_thread_num(threads);
    server.set_connection_callback(|conn| {
        eprintln!(
            "{} {} -> {}",
            if conn.connected() { "up  " } else { "down" },
            conn.peer_addr(),
            conn.local_addr()
        );
    });
    server.set_message_callback(|conn, buf, _when| {
        let data = buf.peek().to_vec();
        buf.retrieve_all();
        conn.send(&data);
    });
    server.start().expect("failed to start");

    eprintln!(
        "echo server listening on {} with {threads} worker threads",
        server.local_addr().expect("local addr")
    );
    event_loop.run();
}
