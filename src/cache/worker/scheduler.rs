//! Background task timer shared by the fetch and server-map pipelines.
//!
//! One worker thread owns a small deadline list and is fed one-shot and
//! repeating tasks over a crossbeam channel. The loop is driven by
//! `recv_timeout` against the nearest deadline so new schedules and shutdown
//! are always observed promptly. Scheduling is a non-blocking channel send
//! and is therefore safe to call while holding a manager lock.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;

/// Work scheduled on the timer thread. Must not block; long work belongs on
/// its own thread.
pub type TimerTask = Box<dyn FnMut() + Send>;

enum TimerCmd {
    Once { delay: Duration, task: TimerTask },
    Repeating { period: Duration, task: TimerTask },
    Shutdown,
}

struct ScheduledTask {
    deadline: Instant,
    period: Option<Duration>,
    task: TimerTask,
}

/// Handle to the timer thread; dropping it shuts the thread down.
pub struct TaskTimer {
    tx: Sender<TimerCmd>,
    worker: Option<JoinHandle<()>>,
}

impl TaskTimer {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        let thread_name = format!("faultline-timer-{}", name);
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_loop(rx))
            .expect("failed to spawn timer thread");
        TaskTimer {
            tx,
            worker: Some(worker),
        }
    }

    /// Schedule `task` to run once after `delay`.
    pub fn schedule_once(&self, delay: Duration, task: impl FnMut() + Send + 'static) {
        let _ = self.tx.send(TimerCmd::Once {
            delay,
            task: Box::new(task),
        });
    }

    /// Schedule `task` to run every `period`, starting one period from now.
    pub fn schedule_repeating(&self, period: Duration, task: impl FnMut() + Send + 'static) {
        let _ = self.tx.send(TimerCmd::Repeating {
            period,
            task: Box::new(task),
        });
    }

    /// Stop the timer thread and join it. Pending tasks are discarded.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.tx.send(TimerCmd::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for TaskTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const IDLE_POLL: Duration = Duration::from_millis(500);

fn run_loop(rx: Receiver<TimerCmd>) {
    let mut scheduled: Vec<ScheduledTask> = Vec::new();
    loop {
        let now = Instant::now();
        let wait = scheduled
            .iter()
            .map(|s| s.deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_POLL);

        match rx.recv_timeout(wait) {
            Ok(TimerCmd::Once { delay, task }) => scheduled.push(ScheduledTask {
                deadline: Instant::now() + delay,
                period: None,
                task,
            }),
            Ok(TimerCmd::Repeating { period, task }) => scheduled.push(ScheduledTask {
                deadline: Instant::now() + period,
                period: Some(period),
                task,
            }),
            Ok(TimerCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                debug!("timer thread stopping with {} tasks pending", scheduled.len());
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let mut idx = 0;
        while idx < scheduled.len() {
            if scheduled[idx].deadline <= now {
                let entry = &mut scheduled[idx];
                (entry.task)();
                match entry.period {
                    Some(period) => {
                        entry.deadline = now + period;
                        idx += 1;
                    }
                    None => {
                        scheduled.swap_remove(idx);
                    }
                }
            } else {
                idx += 1;
            }
        }
    }
}
