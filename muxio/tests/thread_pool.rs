//! Integration tests for the worker loop pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use muxio::{EventLoop, EventLoopThreadPool};

#[test]
fn test_round_robin_cycles_through_all_workers() {
    let base = EventLoop::new().unwrap();
    let mut pool = EventLoopThreadPool::new(base.handle(), "worker");
    pool.set_thread_num(3);
    pool.start(None).unwrap();

    let (tx, rx) = mpsc::channel();
    for slot in 0..6usize {
        let worker = pool.get_next_loop();
        let tx = tx.clone();
        worker.run_in_loop(move || {
            tx.send((slot, thread::current().id())).unwrap();
        });
    }

    let mut tids = vec![None; 6];
    for _ in 0..6 {
        let (slot, tid) = rx.recv().unwrap();
        tids[slot] = Some(tid);
    }
    let first: Vec<_> = tids[..3].iter().map(|t| t.unwrap()).collect();
    let second: Vec<_> = tids[3..].iter().map(|t| t.unwrap()).collect();

    // Three distinct workers, then the same sequence again.
    assert_eq!(first.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(first, second);
    assert!(!first.contains(&thread::current().id()));
}

#[test]
fn test_zero_threads_returns_base_loop() {
    let base = EventLoop::new().unwrap();
    let mut pool = EventLoopThreadPool::new(base.handle(), "worker");
    pool.set_thread_num(0);
    pool.start(None).unwrap();

    let ran_on = Arc::new(std::sync::Mutex::new(None));
    for _ in 0..3 {
        let target = pool.get_next_loop();
        assert!(target.is_in_loop_thread());
        let ran_on_clone = ran_on.clone();
        // Base-loop tasks from the base thread run synchronously.
        target.run_in_loop(move || {
            *ran_on_clone.lock().unwrap() = Some(thread::current().id());
        });
        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
    }
}

#[test]
fn test_loop_for_hash_is_stable() {
    let base = EventLoop::new().unwrap();
    let mut pool = EventLoopThreadPool::new(base.handle(), "worker");
    pool.set_thread_num(2);
    pool.start(None).unwrap();

    for hash in [0usize, 1, 7, 42] {
        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let target = pool.get_loop_for_hash(hash);
            let tx = tx.clone();
            target.run_in_loop(move || tx.send(thread::current().id()).unwrap());
        }
        let a = rx.recv().unwrap();
        let b = rx.recv().unwrap();
        assert_eq!(a, b, "hash {hash} moved between loops");
    }
}

#[test]
fn test_thread_init_callback_runs_once_per_worker() {
    let base = EventLoop::new().unwrap();
    let inits = Arc::new(AtomicUsize::new(0));

    let mut pool = EventLoopThreadPool::new(base.handle(), "worker");
    pool.set_thread_num(2);
    let counter = inits.clone();
    pool.start(Some(Arc::new(move |_loop_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();
    assert_eq!(inits.load(Ordering::SeqCst), 2);

    // With zero workers the init callback runs once, for the base loop.
    let base2 = {
        drop(pool);
        drop(base);
        EventLoop::new().unwrap()
    };
    let inits = Arc::new(AtomicUsize::new(0));
    let mut pool = EventLoopThreadPool::new(base2.handle(), "worker");
    let counter = inits.clone();
    pool.start(Some(Arc::new(move |_loop_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();
    assert_eq!(inits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_all_loops_lists_workers() {
    let base = EventLoop::new().unwrap();
    let mut pool = EventLoopThreadPool::new(base.handle(), "worker");
    pool.set_thread_num(2);
    pool.start(None).unwrap();
    assert_eq!(pool.all_loops().len(), 2);

    assert!(pool.started());
    assert_eq!(pool.name(), "worker");
}
