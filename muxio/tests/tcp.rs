//! End-to-end TCP tests: echo, backpressure, cross-thread sends, client
//! reconnect. Peers are plain std sockets driven from helper threads so the
//! reactor side is exercised against an independent implementation.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxio::{EventLoop, ServerOptions, TcpClient, TcpServer};

fn ephemeral() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn test_echo_roundtrip_and_teardown() {
    let event_loop = EventLoop::new().unwrap();
    let mut server =
        TcpServer::new(&event_loop, &ephemeral(), "echo", ServerOptions::default()).unwrap();
    server.set_message_callback(|conn, buf, _when| {
        let data = buf.peek().to_vec();
        buf.retrieve_all();
        conn.send(&data);
    });
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let disconnects = disconnects.clone();
        let handle = event_loop.handle();
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                disconnects.fetch_add(1, Ordering::SeqCst);
                handle.quit();
            }
        });
    }
    server.start().unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(server_addr).unwrap();
        stream.write_all(b"hello\n").unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\n");
    });

    event_loop.run();
    client.join().unwrap();
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_echo_across_worker_pool() {
    let event_loop = EventLoop::new().unwrap();
    let mut server =
        TcpServer::new(&event_loop, &ephemeral(), "echo", ServerOptions::default()).unwrap();
    server.set_thread_num(2);
    server.set_message_callback(|conn, buf, _when| {
        let data = buf.peek().to_vec();
        buf.retrieve_all();
        conn.send(&data);
    });
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let disconnects = disconnects.clone();
        let handle = event_loop.handle();
        server.set_connection_callback(move |conn| {
            if !conn.connected() && disconnects.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                handle.quit();
            }
        });
    }
    server.start().unwrap();
    let server_addr = server.local_addr().unwrap();

    let clients: Vec<_> = (0..2)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(server_addr).unwrap();
                let payload = format!("client {i} says hi");
                stream.write_all(payload.as_bytes()).unwrap();
                let mut buf = vec![0u8; payload.len()];
                stream.read_exact(&mut buf).unwrap();
                assert_eq!(buf, payload.as_bytes());
            })
        })
        .collect();

    event_loop.run();
    for c in clients {
        c.join().unwrap();
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);
}

#[test]
fn test_send_from_foreign_thread_preserves_order() {
    let event_loop = EventLoop::new().unwrap();
    let mut server =
        TcpServer::new(&event_loop, &ephemeral(), "pusher", ServerOptions::default()).unwrap();
    {
        let handle = event_loop.handle();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                // A compute thread pushes through the connection handle; the
                // sends serialize through the loop in call order.
                let conn = conn.clone();
                thread::spawn(move || {
                    for i in 0..20 {
                        conn.send(format!("msg{i};").as_bytes());
                    }
                });
            } else {
                handle.quit();
            }
        });
    }
    server.start().unwrap();
    let server_addr = server.local_addr().unwrap();

    let expected: String = (0..20).map(|i| format!("msg{i};")).collect();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(server_addr).unwrap();
        let mut got = Vec::new();
        let mut chunk = [0u8; 256];
        while got.len() < expected.len() {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed early");
            got.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(String::from_utf8(got).unwrap(), expected);
    });

    event_loop.run();
    client.join().unwrap();
}

#[test]
fn test_high_water_mark_and_write_complete() {
    const PAYLOAD: usize = 8 * 1024 * 1024;
    const MARK: usize = 64 * 1024;

    let event_loop = EventLoop::new().unwrap();
    let mut server =
        TcpServer::new(&event_loop, &ephemeral(), "firehose", ServerOptions::default()).unwrap();

    let peak_queued = Arc::new(AtomicUsize::new(0));
    let write_complete = Arc::new(AtomicUsize::new(0));
    let output_sizes = Arc::new(Mutex::new(Vec::new()));
    {
        let peak_queued = peak_queued.clone();
        let sizes = output_sizes.clone();
        let handle = event_loop.handle();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let peak = peak_queued.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, queued| {
                        peak.fetch_max(queued, Ordering::SeqCst);
                    }),
                    MARK,
                );
                let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 251) as u8).collect();
                conn.send(&payload);

                // Sample the output buffer from the loop: once the send has
                // returned it must only ever shrink.
                let weak = Arc::downgrade(conn);
                let sizes = sizes.clone();
                conn.loop_handle().run_every(Duration::from_millis(5), move || {
                    if let Some(conn) = weak.upgrade() {
                        let queued = conn.with_output_buffer(|b| b.readable_bytes());
                        sizes.lock().unwrap().push(queued);
                    }
                });
            } else {
                handle.quit();
            }
        });
    }
    {
        let write_complete = write_complete.clone();
        server.set_write_complete_callback(move |_conn| {
            write_complete.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.start().unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(server_addr).unwrap();
        let mut total = 0usize;
        let mut chunk = vec![0u8; 64 * 1024];
        let mut mismatch = false;
        while total < PAYLOAD {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed after {total} bytes");
            for (k, &b) in chunk[..n].iter().enumerate() {
                if b != ((total + k) % 251) as u8 {
                    mismatch = true;
                }
            }
            total += n;
        }
        assert!(!mismatch, "payload corrupted");
        assert_eq!(total, PAYLOAD);
    });

    event_loop.run();
    client.join().unwrap();

    // The socket buffer cannot swallow 8 MiB, so the mark must have been
    // crossed, and the flush must have completed exactly once.
    assert!(peak_queued.load(Ordering::SeqCst) >= MARK);
    assert_eq!(write_complete.load(Ordering::SeqCst), 1);
    let sizes = output_sizes.lock().unwrap();
    assert!(
        sizes.windows(2).all(|w| w[1] <= w[0]),
        "output buffer grew after send returned: {sizes:?}"
    );
}

#[test]
fn test_tcp_client_echo_on_shared_loop() {
    let event_loop = EventLoop::new().unwrap();
    let mut server =
        TcpServer::new(&event_loop, &ephemeral(), "echo", ServerOptions::default()).unwrap();
    server.set_message_callback(|conn, buf, _when| {
        let data = buf.peek().to_vec();
        buf.retrieve_all();
        conn.send(&data);
    });
    server.start().unwrap();
    let server_addr = server.local_addr().unwrap();

    let echoed = Arc::new(AtomicBool::new(false));
    let mut client = TcpClient::new(event_loop.handle(), server_addr, "probe");
    client.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"ping");
        } else {
            conn.loop_handle().quit();
        }
    });
    {
        let echoed = echoed.clone();
        client.set_message_callback(move |conn, buf, _when| {
            if buf.readable_bytes() >= 4 {
                assert_eq!(buf.retrieve_all_as_string(), "ping");
                echoed.store(true, Ordering::SeqCst);
                conn.shutdown();
            }
        });
    }
    client.connect();

    event_loop.run();
    assert!(echoed.load(Ordering::SeqCst));
    assert!(client.connection().is_none());
}

#[test]
fn test_client_retries_until_server_appears() {
    // Reserve a port, release it, and start the client against the dead
    // address; the first attempt gets ECONNREFUSED and schedules a retry.
    let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let event_loop = EventLoop::new().unwrap();
    let connected = Arc::new(AtomicBool::new(false));
    let mut client = TcpClient::new(event_loop.handle(), server_addr, "retrier");
    {
        let connected = connected.clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                connected.store(true, Ordering::SeqCst);
                // Tear down cleanly; the disconnect path quits the loop.
                conn.force_close();
            } else {
                conn.loop_handle().quit();
            }
        });
    }
    client.connect();

    // Bring the listener up while the client backs off.
    let listener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let listener = std::net::TcpListener::bind(server_addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        // Hold the stream open until the client observed the connect.
        thread::sleep(Duration::from_millis(200));
        drop(stream);
    });

    // Safety net so a lost retry cannot hang the test.
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_secs(10), move || handle.quit());

    event_loop.run();
    listener.join().unwrap();
    assert!(connected.load(Ordering::SeqCst));
}

#[test]
fn test_connection_metadata() {
    let event_loop = EventLoop::new().unwrap();
    let mut server =
        TcpServer::new(&event_loop, &ephemeral(), "meta", ServerOptions::default()).unwrap();
    let seen_name = Arc::new(Mutex::new(String::new()));
    {
        let seen_name = seen_name.clone();
        let handle = event_loop.handle();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *seen_name.lock().unwrap() = conn.name().to_string();
                assert_eq!(conn.local_addr().ip(), conn.peer_addr().ip());
                conn.set_context(Box::new(42u32));
                let ctx = conn.take_context().unwrap();
                assert_eq!(*ctx.downcast::<u32>().unwrap(), 42);
                conn.shutdown();
            } else {
                handle.quit();
            }
        });
    }
    server.start().unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(server_addr).unwrap();
        // Wait for the server-initiated shutdown.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    });

    event_loop.run();
    client.join().unwrap();
    let name = seen_name.lock().unwrap();
    assert!(
        name.starts_with("meta-") && name.ends_with("#1"),
        "unexpected connection name {name}"
    );
}
