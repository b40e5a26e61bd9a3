//! Worker threads, each running one event loop.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Runs inside each worker after its loop is constructed, before it polls.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// A thread owning exactly one event loop.
///
/// The loop is constructed inside the spawned thread (loops are pinned to
/// their constructing thread); `start` blocks until the handle is ready.
/// Dropping the thread quits its loop and joins.
pub struct EventLoopThread {
    loop_: LoopHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> Result<EventLoopThread, Error> {
        let (tx, rx) = mpsc::channel::<Result<LoopHandle, Error>>();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if let Some(init) = &init {
                    init(&event_loop.handle());
                }
                let _ = tx.send(Ok(event_loop.handle()));
                event_loop.run();
            })
            .map_err(Error::Io)?;

        match rx.recv() {
            Ok(Ok(handle)) => Ok(EventLoopThread {
                loop_: handle,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(Error::Io(io::Error::other(
                    "worker thread died during startup",
                )))
            }
        }
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.loop_.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// N worker loops handed out round-robin, plus the owner-supplied base loop.
///
/// With zero workers every getter returns the base loop, so single-threaded
/// embedders run everything on one loop without special cases. Owned by the
/// base loop's thread; the getters assert that.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    num_threads: usize,
    started: bool,
    next: Cell<usize>,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            num_threads: 0,
            started: false,
            next: Cell::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(!self.started);
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            let t = EventLoopThread::start(name, init.clone())?;
            self.loops.push(t.loop_handle());
            self.threads.push(t);
        }
        if self.num_threads == 0
            && let Some(init) = init
        {
            init(&self.base);
        }
        Ok(())
    }

    /// The next loop, round-robin from worker 0. Base loop when N = 0.
    pub fn get_next_loop(&self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let i = self.next.get();
        self.next.set((i + 1) % self.loops.len());
        self.loops[i].clone()
    }

    /// A stable loop for `hash`: `loops[hash % N]`. Base loop when N = 0.
    pub fn get_loop_for_hash(&self, hash: usize) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            self.base.clone()
        } else {
            self.loops[hash % self.loops.len()].clone()
        }
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        self.base.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
