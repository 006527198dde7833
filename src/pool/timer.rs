use crate::pool::thread_pool::{FnTask, Task, ThreadPool, Worker};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Timer {
    due: Instant,
    callback: Callback,
}

#[derive(Default)]
struct Timers {
    next_id: u64,
    entries: HashMap<u64, Timer>,
}

/// One-shot timers, checked every `tick` by a task on its own thread.
///
/// Due callbacks are queued on the thread pool at `level`, never run on
/// the timer thread itself.
#[derive(Clone)]
pub(crate) struct TimerPool {
    timers: Arc<Mutex<Timers>>,
    pool: ThreadPool,
    level: usize,
    tick: Duration,
}

impl TimerPool {
    pub(crate) fn new(pool: ThreadPool, level: usize, tick: Duration) -> Self {
        Self {
            timers: Arc::new(Mutex::new(Timers::default())),
            pool,
            level,
            tick,
        }
    }

    /// Starts the checking task past the last queue level.
    pub(crate) fn start(&self) -> bool {
        let level = self.pool.levels();
        self.pool.append_task(Box::new(self.clone()), level)
    }

    /// Runs `callback` once, `duration` from now. Ids start at 1.
    pub(crate) fn append_timer<F>(&self, duration: Duration, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);

        let mut id = timers.next_id;
        loop {
            id = id.wrapping_add(1).max(1);
            if !timers.entries.contains_key(&id) {
                break;
            }
        }
        timers.next_id = id;

        timers.entries.insert(
            id,
            Timer {
                due: Instant::now() + duration,
                callback: Box::new(callback),
            },
        );
        id
    }

    /// Cancels a timer that has not fired yet. Id `0` is ignored.
    pub(crate) fn remove_timer(&self, id: u64) -> bool {
        if id == 0 {
            return false;
        }

        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(&id)
            .is_some()
    }

    fn fire_due(&self) {
        let now = Instant::now();

        let due: Vec<Callback> = {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<u64> = timers
                .entries
                .iter()
                .filter(|(_, timer)| timer.due <= now)
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| timers.entries.remove(&id))
                .map(|timer| timer.callback)
                .collect()
        };

        for callback in due {
            self.pool
                .append_task(Box::new(FnTask::new(move |_: &Worker| callback())), self.level);
        }
    }
}

impl Task for TimerPool {
    fn run(&mut self, _: &Worker) {
        self.fire_due();
        thread::sleep(self.tick);
    }

    #[inline]
    fn retry(&self) -> bool {
        !self.pool.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_and_removes() {
        let pool = ThreadPool::new(2, 1).unwrap();
        let timers = TimerPool::new(pool.clone(), 0, Duration::from_millis(5));
        assert!(timers.start());

        let (tx, rx) = mpsc::channel();

        let tx_late = tx.clone();
        let late = timers.append_timer(Duration::from_millis(300), move || tx_late.send("late").unwrap());
        let early = timers.append_timer(Duration::from_millis(10), move || tx.send("early").unwrap());

        assert_ne!(late, 0);
        assert_ne!(early, late);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("early"));
        assert!(timers.remove_timer(late));
        assert!(!timers.remove_timer(late));
        assert!(!timers.remove_timer(early));
        assert!(!timers.remove_timer(0));

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        pool.stop();
    }
}
