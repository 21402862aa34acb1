// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Deferred task execution against a [`Clock`].
//!
//! Modules that need to act at a point in virtual time (rectifier ticks,
//! regulator wake-ups) schedule tasks here instead of owning timers. Tasks
//! run in scheduled-time order; a task whose due time is already past runs
//! as soon as the scheduler is serviced.

use crate::clock::Clock;
use crate::fraction::Fraction;
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Opaque handle for cancellation. Zero is never issued.
pub type TaskId = u64;

/// A scheduled task. Receives the time it was scheduled for, which may be
/// earlier than the clock if the task fired late.
pub type TaskFn = Box<dyn FnOnce(Fraction) -> BoxFuture<'static, ()> + Send>;

/// Deferred execution of tasks at points in clock time.
pub trait Scheduler: Send + Sync {
    /// Run `task` when the clock reaches `time`.
    fn schedule_at(&self, task: TaskFn, time: Fraction) -> TaskId;

    /// Run `task` after `delay` from now.
    fn schedule_in(&self, task: TaskFn, delay: Fraction) -> TaskId;

    /// Cancel a pending task. Returns true if the task was still pending.
    fn cancel(&self, id: TaskId) -> bool;
}

/// Re-arming periodic schedule: runs `task` at `start`, `start + period`, ...
///
/// The next occurrence is armed before the task body runs, so a slow task
/// does not shift the phase of the series.
pub fn schedule_every(
    scheduler: Arc<dyn Scheduler>,
    task: Arc<dyn Fn(Fraction) -> BoxFuture<'static, ()> + Send + Sync>,
    period: Fraction,
    start: Fraction,
) -> TaskId {
    let sched = scheduler.clone();
    scheduler.schedule_at(
        Box::new(move |time| {
            Box::pin(async move {
                schedule_every(sched, task.clone(), period, time + period);
                task(time).await;
            })
        }),
        start,
    )
}

struct Entry {
    due: Fraction,
    id: TaskId,
    task: TaskFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reverse ordering: BinaryHeap is a max-heap, we want the earliest deadline
// on top. Ties resolve by insertion order (id).
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Entry>,
    tombstones: HashSet<TaskId>,
    next_id: TaskId,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wakeup: Notify,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn insert(&self, task: TaskFn, due: Fraction) -> TaskId {
        let id = {
            let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            st.next_id += 1;
            let id = st.next_id;
            st.heap.push(Entry { due, id, task });
            id
        };
        self.wakeup.notify_one();
        id
    }
}

enum Step {
    Run(TaskFn, Fraction),
    Sleep(Duration),
    Idle,
    Quit,
}

/// Wall-clock scheduler: one worker task sleeps until the next due time, or
/// is notified when a sooner task arrives.
pub struct SystemScheduler {
    shared: Arc<Shared>,
}

impl SystemScheduler {
    /// Spawns the worker on the current tokio runtime.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared { state: Mutex::new(SchedulerState::default()), wakeup: Notify::new(), clock });
        let worker = shared.clone();
        tokio::spawn(async move {
            loop {
                match Self::next_step(&worker) {
                    Step::Run(task, due) => task(due).await,
                    Step::Sleep(d) => {
                        tokio::select! {
                            () = tokio::time::sleep(d) => {},
                            () = worker.wakeup.notified() => {},
                        }
                    },
                    Step::Idle => worker.wakeup.notified().await,
                    Step::Quit => break,
                }
            }
        });
        Self { shared }
    }

    fn next_step(shared: &Shared) -> Step {
        let mut st = shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if st.shutdown {
            return Step::Quit;
        }
        // discard cancelled entries lazily
        while let Some(head_id) = st.heap.peek().map(|head| head.id) {
            if st.tombstones.remove(&head_id) {
                st.heap.pop();
            } else {
                break;
            }
        }
        let Some(head) = st.heap.peek() else { return Step::Idle };
        let now = shared.clock.now();
        if head.due <= now {
            let Some(entry) = st.heap.pop() else { return Step::Idle };
            return Step::Run(entry.task, entry.due);
        }
        let speed = shared.clock.speed();
        if speed <= 0.0 {
            // the clock will never reach the deadline on its own
            return Step::Idle;
        }
        let secs = (head.due - now).as_f64() / speed;
        Step::Sleep(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Stop the worker. Pending tasks are dropped.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.shutdown = true;
        drop(st);
        self.shared.wakeup.notify_one();
    }
}

impl Drop for SystemScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler for SystemScheduler {
    fn schedule_at(&self, task: TaskFn, time: Fraction) -> TaskId {
        self.shared.insert(task, time)
    }

    fn schedule_in(&self, task: TaskFn, delay: Fraction) -> TaskId {
        let due = self.shared.clock.now() + delay;
        self.shared.insert(task, due)
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut st = self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if st.heap.iter().any(|e| e.id == id) && st.tombstones.insert(id) {
            return true;
        }
        false
    }
}

/// Test scheduler paired with a [`TestClock`](crate::clock::TestClock):
/// tasks fire when [`TestScheduler::advance_to`] moves the clock across
/// their due time, in deadline order, on the caller's task.
pub struct TestScheduler {
    state: Mutex<SchedulerState>,
    clock: Arc<crate::clock::TestClock>,
}

impl TestScheduler {
    pub fn new(clock: Arc<crate::clock::TestClock>) -> Self {
        Self { state: Mutex::new(SchedulerState::default()), clock }
    }

    /// Move the clock to `target`, firing every due task in order. Tasks
    /// scheduled by running tasks (re-arming ticks) are honored within the
    /// same advance.
    pub async fn advance_to(&self, target: Fraction) {
        loop {
            let next = {
                let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    match st.heap.peek() {
                        Some(head) if st.tombstones.contains(&head.id) => {
                            let id = head.id;
                            st.heap.pop();
                            st.tombstones.remove(&id);
                        },
                        Some(head) if head.due <= target => {
                            let Some(entry) = st.heap.pop() else { break None };
                            break Some(entry);
                        },
                        _ => break None,
                    }
                }
            };
            match next {
                Some(entry) => {
                    self.clock.set_time(entry.due);
                    (entry.task)(entry.due).await;
                },
                None => break,
            }
        }
        self.clock.set_time(target);
    }
}

impl Scheduler for TestScheduler {
    fn schedule_at(&self, task: TaskFn, time: Fraction) -> TaskId {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.next_id += 1;
        let id = st.next_id;
        st.heap.push(Entry { due: time, id, task });
        id
    }

    fn schedule_in(&self, task: TaskFn, delay: Fraction) -> TaskId {
        let due = self.clock.now() + delay;
        self.schedule_at(task, due)
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut st = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if st.heap.iter().any(|e| e.id == id) && st.tombstones.insert(id) {
            return true;
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, TestClock};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn record(log: &Arc<Mutex<Vec<i64>>>, tag: i64) -> TaskFn {
        let log = log.clone();
        Box::new(move |_| {
            Box::pin(async move {
                log.lock().unwrap().push(tag);
            })
        })
    }

    #[tokio::test]
    async fn fires_in_deadline_order_on_mock_clock() {
        let clock = Arc::new(TestClock::default());
        let sched = TestScheduler::new(clock.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        sched.schedule_at(record(&log, 2), Fraction::new(20, 1000));
        sched.schedule_at(record(&log, 1), Fraction::new(10, 1000));
        sched.schedule_at(record(&log, 3), Fraction::new(30, 1000));

        sched.advance_to(Fraction::new(5, 1000)).await;
        assert!(log.lock().unwrap().is_empty());

        sched.advance_to(Fraction::new(25, 1000)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);

        sched.advance_to(Fraction::new(50, 1000)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cancelled_task_never_fires() {
        let clock = Arc::new(TestClock::default());
        let sched = TestScheduler::new(clock);
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = sched.schedule_at(record(&log, 1), Fraction::new(10, 1000));
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id)); // already gone

        sched.advance_to(Fraction::new(1, 1)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_arming_task_fires_within_one_advance() {
        let clock = Arc::new(TestClock::default());
        let sched = Arc::new(TestScheduler::new(clock));
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        schedule_every(
            sched.clone(),
            Arc::new(move |_| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, AtomicOrdering::SeqCst);
                })
            }),
            Fraction::new(1, 25),
            Fraction::new(0, 1),
        );

        // [0s, 1s] at 25 fps: ticks at 0, 1/25, ..., 25/25
        sched.advance_to(Fraction::new(1, 1)).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 26);
    }

    #[tokio::test]
    async fn system_scheduler_runs_past_due_tasks() {
        let clock = Arc::new(SystemClock::new(1.0));
        let sched = SystemScheduler::new(clock);
        let log = Arc::new(Mutex::new(Vec::new()));

        sched.schedule_in(record(&log, 7), Fraction::new(1, 1000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![7]);
        sched.shutdown();
    }
}
