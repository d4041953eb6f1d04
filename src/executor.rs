//! Background executor — an ambient collaborator consumed as a narrow
//! interface (anything supporting `execute(task)` suffices). `ThreadPoolExecutor`
//! is a small fixed-size worker pool over a bounded queue, mirroring
//! `wofferl-proxmox-backup`'s use of `crossbeam-channel` for internal work
//! queues. `InlineExecutor` runs tasks synchronously for tests.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};

pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
    /// Blocks until every task submitted before this call has completed.
    fn sync(&self);
}

enum Job {
    Task(Box<dyn FnOnce() + Send>),
    Shutdown,
}

pub struct ThreadPoolExecutor {
    sender: Sender<Job>,
    pending: Arc<(Mutex<u64>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    pub fn new(num_workers: usize) -> Self {
        let (tx, rx) = bounded::<Job>(4096);
        let pending = Arc::new((Mutex::new(0u64), Condvar::new()));
        let mut workers = Vec::with_capacity(num_workers.max(1));
        for i in 0..num_workers.max(1) {
            let rx = rx.clone();
            let pending = pending.clone();
            let handle = thread::Builder::new()
                .name(format!("docstore-exec-{i}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Task(f)) => {
                            f();
                            let (lock, cvar) = &*pending;
                            let mut n = lock.lock().unwrap();
                            *n -= 1;
                            if *n == 0 {
                                cvar.notify_all();
                            }
                        }
                        Ok(Job::Shutdown) | Err(_) => break,
                    }
                })
                .expect("spawn docstore executor worker");
            workers.push(handle);
        }
        Self {
            sender: tx,
            pending,
            workers,
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        {
            let (lock, _) = &*self.pending;
            *lock.lock().unwrap() += 1;
        }
        if self.sender.send(Job::Task(task)).is_err() {
            let (lock, cvar) = &*self.pending;
            let mut n = lock.lock().unwrap();
            *n -= 1;
            cvar.notify_all();
        }
    }

    fn sync(&self) {
        let (lock, cvar) = &*self.pending;
        let mut n = lock.lock().unwrap();
        while *n > 0 {
            n = cvar.wait(n).unwrap();
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Job::Shutdown);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Runs every task synchronously on the calling thread. `sync()` is a
/// no-op since nothing is ever outstanding.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }

    fn sync(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn thread_pool_executes_and_syncs() {
        let exec = ThreadPoolExecutor::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            exec.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        exec.sync();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let exec = InlineExecutor;
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        exec.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
