//! Task runner: single-flight admission, panic/failure capture and outcome
//! delivery on one channel.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::{
    core::truncate_message,
    error::SubmitError,
    tasks::{Task, TaskContext, TaskKey, TaskSignal},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Terminated,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const TERMINATED: u8 = 2;

/// Idle -> Running -> Terminated. Only the transition into `Terminated`
/// grants the right to deliver a signal, so a task delivers at most once.
#[derive(Debug, Default)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn begin(&self) -> bool {
        self.0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn terminate(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> TaskState {
        match self.0.load(Ordering::Acquire) {
            IDLE => TaskState::Idle,
            RUNNING => TaskState::Running,
            _ => TaskState::Terminated,
        }
    }
}

/// One task's terminal signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: TaskId,
    pub key: TaskKey,
    pub signal: TaskSignal,
}

/// Consumer end of the outcome channel. Whoever owns it is the single
/// sequencing point for outcome handling.
pub struct OutcomeReceiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl OutcomeReceiver {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    key: TaskKey,
    cancel_tx: Arc<watch::Sender<bool>>,
    lifecycle: Arc<Lifecycle>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Terminated
    }

    /// Requests cooperative cancellation. A remote call already in flight
    /// completes; the task stops at its next check.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

struct InFlight {
    id: TaskId,
    handle: TaskHandle,
}

struct Inner {
    in_flight: Mutex<HashMap<TaskKey, InFlight>>,
    outcome_tx: mpsc::UnboundedSender<Delivery>,
    next_id: AtomicU64,
}

impl Inner {
    /// The map stays consistent even if a holder panicked, so poisoning is
    /// recovered rather than propagated.
    fn in_flight(&self) -> MutexGuard<'_, HashMap<TaskKey, InFlight>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, key: &TaskKey, id: TaskId) {
        let mut in_flight = self.in_flight();
        if in_flight.get(key).map(|entry| entry.id) == Some(id) {
            in_flight.remove(key);
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> (Self, OutcomeReceiver) {
        let (outcome_tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Inner {
                in_flight: Mutex::new(HashMap::new()),
                outcome_tx,
                next_id: AtomicU64::new(1),
            }),
        };
        (scheduler, OutcomeReceiver { rx })
    }

    /// Starts `task` unless a task with the same key is in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<T: Task>(&self, task: T) -> Result<TaskHandle, SubmitError> {
        let key = task.key();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = {
            let mut in_flight = self.inner.in_flight();
            if in_flight.contains_key(&key) {
                debug!("rejecting {key}: already running");
                return Err(SubmitError::AlreadyRunning { key });
            }
            let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            let handle = TaskHandle {
                id,
                key: key.clone(),
                cancel_tx: Arc::new(cancel_tx),
                lifecycle: Arc::new(Lifecycle::default()),
            };
            in_flight.insert(
                key.clone(),
                InFlight {
                    id,
                    handle: handle.clone(),
                },
            );
            handle
        };

        let inner = Arc::clone(&self.inner);
        let lifecycle = Arc::clone(&handle.lifecycle);
        let id = handle.id;
        let task: Box<dyn Task> = Box::new(task);
        tokio::spawn(async move {
            lifecycle.begin();
            debug!("task {key} (#{}) started", id.get());
            let ctx = TaskContext::new(cancel_rx);
            // A nested spawn turns a panic inside the task into a JoinError.
            let signal = match tokio::spawn(task.run(ctx)).await {
                Ok(Ok(signal)) => signal,
                Ok(Err(failure)) => {
                    error!("{key} failed ({:?}): {failure}", failure.kind());
                    TaskSignal::Failed(truncate_message(&failure.to_string(), 300))
                }
                Err(join_error) => {
                    let diagnostic = if join_error.is_panic() {
                        format!("{key} panicked")
                    } else {
                        format!("{key} was aborted")
                    };
                    error!("{diagnostic}");
                    TaskSignal::Failed(diagnostic)
                }
            };

            inner.release(&key, id);
            if lifecycle.terminate() {
                debug!("task {key} (#{}) finished: {:?}", id.get(), signal.outcome());
                let _ = inner.outcome_tx.send(Delivery { id, key, signal });
            }
        });

        Ok(handle)
    }

    pub fn cancel(&self, handle: &TaskHandle) {
        handle.cancel();
    }

    pub fn cancel_all(&self) {
        for entry in self.inner.in_flight().values() {
            entry.handle.cancel();
        }
    }

    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.inner.in_flight().contains_key(key)
    }

    pub fn in_flight(&self) -> Vec<TaskKey> {
        self.inner.in_flight().keys().cloned().collect()
    }
}
