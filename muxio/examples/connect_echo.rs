use std::net::SocketAddr;

use muxio::{EventLoop, TcpClient};

fn main() {
    muxio::logging::init("info");

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .expect("server address");

    let event_loop = EventLoop::new().expect("event loop");
    let mut client = TcpClient::new(event_loop.handle(), addr, "connect-echo");
    client.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"hello from muxio\n");
        } else {
            conn.loop_handle().quit();
        }
    });
    client.set_message_callback(|conn, buf, _when| {
        print!("{}", buf.retrieve_all_as_string());
        conn.shutdown();
    });
    client.connect();

    event_loop.run();
}
