//! Bounded worker pools for flush and merge tasks
//!
//! Submitting never blocks: jobs queue on an unbounded channel and the caller
//! receives a [`TaskFuture`] it may wait on later.

use crate::{Result, TesseraError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

type TaskResult<T> = std::result::Result<T, Arc<TesseraError>>;

struct Slot<T> {
    result: Mutex<Option<TaskResult<T>>>,
    done: Condvar,
}

/// Handle on the result of a background task
pub struct TaskFuture<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> TaskFuture<T> {
    /// An already completed future
    pub fn ready(value: T) -> Self {
        Self::with_result(Some(Ok(value)))
    }

    /// An already failed future
    pub fn failed(error: TesseraError) -> Self {
        Self::with_result(Some(Err(Arc::new(error))))
    }

    fn with_result(result: Option<TaskResult<T>>) -> Self {
        Self {
            slot: Arc::new(Slot {
                result: Mutex::new(result),
                done: Condvar::new(),
            }),
        }
    }

    /// A pending future and the completer that resolves it
    pub fn pending() -> (Self, TaskCompleter<T>) {
        let future = Self::with_result(None);
        let completer = TaskCompleter {
            slot: Some(future.slot.clone()),
        };
        (future, completer)
    }

    pub fn is_done(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Block until the task finishes
    pub fn wait(&self) -> Result<T> {
        let mut result = self.slot.result.lock();
        while result.is_none() {
            self.slot.done.wait(&mut result);
        }
        Self::unpack(result.as_ref())
    }

    /// Block for at most `timeout`; `None` if the task is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let mut result = self.slot.result.lock();
        if result.is_none() {
            self.slot.done.wait_for(&mut result, timeout);
        }
        result.as_ref().map(|r| Self::unpack(Some(r)))
    }

    fn unpack(result: Option<&TaskResult<T>>) -> Result<T> {
        match result {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(e)) => Err(TesseraError::Task(e.clone())),
            None => Err(TesseraError::Internal("task result missing".into())),
        }
    }
}

/// Resolves a [`TaskFuture`]; a completer dropped unresolved fails it
pub struct TaskCompleter<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> TaskCompleter<T> {
    pub fn complete(mut self, result: Result<T>) {
        self.resolve(result.map_err(Arc::new));
    }

    fn resolve(&mut self, result: TaskResult<T>) {
        if let Some(slot) = self.slot.take() {
            *slot.result.lock() = Some(result);
            slot.done.notify_all();
        }
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        self.resolve(Err(Arc::new(TesseraError::Internal(
            "task dropped before completion".into(),
        ))));
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let active = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver: Receiver<Job> = receiver.clone();
            let active = active.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        active.fetch_add(1, Ordering::SeqCst);
                        job();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })?;
            workers.push(handle);
        }
        debug!("Started pool {} with {} threads", name, threads);

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            active,
            threads,
        })
    }

    /// Queue a task; its result (or panic) resolves the returned future
    pub fn submit<T, F>(&self, task: F) -> TaskFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (future, completer) = TaskFuture::pending();
        let pool = self.name.clone();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
                error!("Task in pool {} panicked", pool);
                Err(TesseraError::Internal(format!("task in pool {} panicked", pool)))
            });
            completer.complete(result);
        });

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(job).is_ok() => future,
            _ => TaskFuture::failed(TesseraError::Closed(format!("pool {}", self.name))),
        }
    }

    /// Workers currently running a task
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, |s| s.len())
    }

    /// Stop accepting tasks, run the queued ones, and join the workers
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker of pool {} exited abnormally", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let futures: Vec<_> = (0..8u64).map(|i| pool.submit(move || Ok(i * 2))).collect();
        let results: Vec<u64> = futures.iter().map(|f| f.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_errors_and_panics_reach_future() {
        let pool = WorkerPool::new("test", 1).unwrap();

        let failed = pool.submit::<(), _>(|| Err(TesseraError::Merge("boom".into())));
        assert!(matches!(failed.wait(), Err(TesseraError::Task(_))));

        let panicked = pool.submit::<(), _>(|| panic!("worker panic"));
        assert!(panicked.wait().is_err());

        // The worker survives the panic
        assert_eq!(pool.submit(|| Ok(7)).wait().unwrap(), 7);
    }

    #[test]
    fn test_wait_timeout_and_active_count() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let future = pool.submit(move || {
            rx.recv().ok();
            Ok(())
        });

        assert!(future.wait_timeout(Duration::from_millis(20)).is_none());
        for _ in 0..100 {
            if pool.active_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.active_count(), 1);
        tx.send(()).unwrap();
        assert!(future.wait().is_ok());
        assert!(future.is_done());
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.submit(|| Ok(1)).wait(),
            Err(TesseraError::Task(_))
        ));
        assert!(TaskFuture::ready(3).is_done());
    }
}
