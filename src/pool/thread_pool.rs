use crossbeam::queue::SegQueue;
use std::{
    future::Future,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error};

/// Unit of work run by a [`Worker`].
///
/// After [`run`](Self::run) returns, a task whose [`retry`](Self::retry) is
/// `true` goes back to the queue it came from.
pub(crate) trait Task: Send + 'static {
    fn run(&mut self, worker: &Worker);

    #[inline]
    fn retry(&self) -> bool {
        false
    }
}

/// A one-shot closure.
pub(crate) struct FnTask<F>(Option<F>);

impl<F: FnOnce(&Worker) + Send + 'static> FnTask<F> {
    #[inline]
    pub(crate) fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce(&Worker) + Send + 'static> Task for FnTask<F> {
    fn run(&mut self, worker: &Worker) {
        if let Some(f) = self.0.take() {
            f(worker);
        }
    }
}

/// A pool thread with its own single-threaded Tokio runtime.
pub(crate) struct Worker {
    runtime: Runtime,
    index: usize,
}

impl Worker {
    fn new(index: usize) -> io::Result<Self> {
        Ok(Self {
            runtime: Builder::new_current_thread().enable_all().build()?,
            index,
        })
    }

    /// Drives `future` to completion on this worker.
    #[inline]
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

type Queued = Box<dyn Task>;

struct Shared {
    queues: Vec<SegQueue<Queued>>,
    lock: Mutex<()>,
    wakeup: Condvar,
    stopped: AtomicBool,
}

impl Shared {
    /// Highest level first.
    fn pop(&self) -> Option<(Queued, usize)> {
        self.queues
            .iter()
            .enumerate()
            .rev()
            .find_map(|(level, queue)| queue.pop().map(|task| (task, level)))
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(SegQueue::is_empty)
    }

    fn push(&self, task: Queued, level: usize) {
        self.queues[level].push(task);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wakeup.notify_one();
    }
}

/// Fixed worker threads over prioritized lock-free queues.
///
/// ```text
///  append_task(task, level)
///        ||
///  [ 0 ] [ 1 ] ... [ levels - 1 ]   <- popped from the right
///        \\      ||      //
///        [ worker threads ]
///
///  level >= levels  ->  a detached thread of its own
/// ```
#[derive(Clone)]
pub(crate) struct ThreadPool {
    shared: Arc<Shared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ThreadPool {
    pub(crate) fn new(threads: usize, levels: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queues: (0..levels.max(1)).map(|_| SegQueue::new()).collect(),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("trellis-worker-{index}"))
                .spawn(move || match Worker::new(index) {
                    Ok(worker) => work(&shared, &worker),
                    Err(err) => error!("worker {index} has no runtime: {err}"),
                })?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            handles: Arc::new(Mutex::new(handles)),
        })
    }

    #[inline]
    pub(crate) fn levels(&self) -> usize {
        self.shared.queues.len()
    }

    /// Queues `task` at `level`, or gives it a thread of its own when
    /// `level` is past the last queue. Returns `false` once stopped.
    pub(crate) fn append_task(&self, task: Box<dyn Task>, level: usize) -> bool {
        if self.shared.stopped.load(Ordering::Acquire) {
            return false;
        }

        if level < self.levels() {
            self.shared.push(task, level);
            return true;
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("trellis-detached".into())
            .spawn(move || match Worker::new(usize::MAX) {
                Ok(worker) => detached(&shared, &worker, task),
                Err(err) => error!("detached task has no runtime: {err}"),
            });

        match spawned {
            Ok(handle) => {
                self.handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
                true
            }
            Err(err) => {
                error!("cannot spawn a detached task: {err}");
                false
            }
        }
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Wakes every thread and waits for them to leave. Queued tasks are dropped.
    pub(crate) fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        {
            let _guard = self.shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.shared.wakeup.notify_all();
        }

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// Runs `task` once; `true` if it asks to run again.
fn run_once(task: &mut Queued, worker: &Worker) -> bool {
    match catch_unwind(AssertUnwindSafe(|| task.run(worker))) {
        Ok(()) => task.retry(),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());

            error!("task panicked on worker {}: {message}", worker.index());
            false
        }
    }
}

fn work(shared: &Shared, worker: &Worker) {
    while !shared.stopped.load(Ordering::Acquire) {
        match shared.pop() {
            Some((mut task, level)) => {
                if run_once(&mut task, worker) && !shared.stopped.load(Ordering::Acquire) {
                    shared.push(task, level);
                }
            }
            None => {
                let guard = shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
                if shared.is_empty() && !shared.stopped.load(Ordering::Acquire) {
                    let _ = shared
                        .wakeup
                        .wait_timeout(guard, Duration::from_millis(100))
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    debug!("worker {} stopped", worker.index());
}

fn detached(shared: &Shared, worker: &Worker, mut task: Queued) {
    while run_once(&mut task, worker) && !shared.stopped.load(Ordering::Acquire) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{atomic::AtomicUsize, mpsc};

    struct Countdown {
        left: usize,
        done: mpsc::Sender<usize>,
    }

    impl Task for Countdown {
        fn run(&mut self, _: &Worker) {
            self.left -= 1;
            if self.left == 0 {
                let _ = self.done.send(0);
            }
        }

        fn retry(&self) -> bool {
            self.left > 0
        }
    }

    struct Panics;

    impl Task for Panics {
        fn run(&mut self, _: &Worker) {
            panic!("boom");
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn runs_closures_on_workers() {
        let pool = ThreadPool::new(4, 3).unwrap();
        let (tx, rx) = mpsc::channel();

        for level in 0..3 {
            let tx = tx.clone();
            assert!(pool.append_task(
                Box::new(FnTask::new(move |worker: &Worker| {
                    let value = worker.block_on(async move { level * 10 });
                    tx.send(value).unwrap();
                })),
                level,
            ));
        }

        let mut got: Vec<usize> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        got.sort();
        assert_eq!(got, [0, 10, 20]);

        pool.stop();
        assert!(!pool.append_task(Box::new(FnTask::new(|_: &Worker| {})), 0));
    }

    #[test]
    fn retry_and_panic() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (tx, rx) = mpsc::channel();

        pool.append_task(Box::new(Panics), 0);
        pool.append_task(Box::new(Countdown { left: 5, done: tx }), 0);

        // The worker outlived the panic and ran the countdown five times
        assert_eq!(rx.recv_timeout(WAIT), Ok(0));
        pool.stop();
    }

    #[test]
    fn highest_level_first() {
        let pool = ThreadPool::new(1, 2).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();

        // Hold the only worker until both tasks are queued
        pool.append_task(
            Box::new(FnTask::new(move |_: &Worker| {
                let _ = gate_rx.recv_timeout(WAIT);
            })),
            0,
        );
        thread::sleep(Duration::from_millis(50));

        for level in [0, 1] {
            let tx = tx.clone();
            pool.append_task(Box::new(FnTask::new(move |_: &Worker| tx.send(level).unwrap())), level);
        }
        gate_tx.send(()).unwrap();

        assert_eq!(rx.recv_timeout(WAIT), Ok(1));
        assert_eq!(rx.recv_timeout(WAIT), Ok(0));
        pool.stop();
    }

    #[test]
    fn detached_level() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let counter = runs.clone();
        pool.append_task(
            Box::new(FnTask::new(move |worker: &Worker| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(worker.index()).unwrap();
            })),
            7,
        );

        assert_eq!(rx.recv_timeout(WAIT), Ok(usize::MAX));
        pool.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
