//! Integration tests for the event loop's threading contract.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoop, PollerBackend};

#[test]
fn test_run_in_loop_from_other_thread_runs_in_loop_thread() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let loop_tid = thread::current().id();

    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let tx = tx.clone();
        let quit_h = handle.clone();
        handle.run_in_loop(move || {
            tx.send(thread::current().id()).unwrap();
        });
        // Quit as a queued task so it cannot outrun the probe above.
        handle.run_in_loop(move || quit_h.quit());
    });

    event_loop.run();
    worker.join().unwrap();
    assert_eq!(rx.recv().unwrap(), loop_tid);
}

#[test]
fn test_run_in_loop_on_loop_thread_is_synchronous() {
    let event_loop = EventLoop::new().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));
    // No run() needed: same-thread tasks execute inline.
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_queue_during_pending_drain_is_not_starved() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let second_ran = Arc::new(AtomicBool::new(false));

    let h = handle.clone();
    let flag = second_ran.clone();
    let worker = thread::spawn(move || {
        let inner_h = h.clone();
        h.queue_in_loop(move || {
            // Enqueued while the loop drains its pending queue; the wakeup
            // issued for this case keeps it from waiting out a full poll.
            let quit_h = inner_h.clone();
            let flag = flag.clone();
            inner_h.queue_in_loop(move || {
                flag.store(true, Ordering::SeqCst);
                quit_h.quit();
            });
        });
    });

    let start = Instant::now();
    event_loop.run();
    worker.join().unwrap();
    assert!(second_ran.load(Ordering::SeqCst));
    // Well under the 10 s poll ceiling proves the wakeup happened.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_tasks_run_in_enqueue_order() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let worker = {
        let handle = handle.clone();
        let order = order.clone();
        thread::spawn(move || {
            for i in 0..100 {
                let order = order.clone();
                handle.queue_in_loop(move || order.lock().unwrap().push(i));
            }
            let quit_h = handle.clone();
            handle.queue_in_loop(move || quit_h.quit());
        })
    };

    event_loop.run();
    worker.join().unwrap();
    let seen = order.lock().unwrap();
    assert_eq!(*seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_second_loop_on_same_thread_panics() {
    let _event_loop = EventLoop::new().unwrap();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = EventLoop::new();
    }));
    assert!(result.is_err());
}

#[test]
fn test_assert_in_loop_thread_panics_cross_thread() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let worker = thread::spawn(move || handle.assert_in_loop_thread());
    assert!(worker.join().is_err());

    let handle = event_loop.handle();
    assert!(handle.is_in_loop_thread());
    handle.assert_in_loop_thread();
}

#[test]
fn test_quit_from_other_thread_wakes_the_poll() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let start = Instant::now();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });
    event_loop.run();
    worker.join().unwrap();
    // Exit must come from the wakeup, not the 10 s poll timeout.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_poll_backend_drives_timers_and_tasks() {
    let event_loop = EventLoop::with_backend(PollerBackend::Poll).unwrap();
    let handle = event_loop.handle();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let h = handle.clone();
    event_loop.run_after(Duration::from_millis(20), move || {
        f.fetch_add(1, Ordering::SeqCst);
        h.quit();
    });

    let worker = {
        let handle = handle.clone();
        let fired = fired.clone();
        thread::spawn(move || {
            handle.run_in_loop(move || {
                fired.fetch_add(10, Ordering::SeqCst);
            });
        })
    };

    event_loop.run();
    worker.join().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 11);
}

#[test]
fn test_iteration_counter_advances() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.quit();
    });
    event_loop.run();
    assert!(event_loop.iteration() >= 1);
    assert!(event_loop.poll_return_time().is_valid());
}
