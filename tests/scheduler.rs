mod common;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{app, MockClient};
use gotify_tray::{
    tasks::{GetApplications, GetMessages},
    Scheduler, SubmitError, Task, TaskContext, TaskError, TaskKey, TaskKind, TaskOutcome,
    TaskSignal, TaskState,
};
use tokio::time::timeout;

#[tokio::test]
async fn second_submit_of_same_key_is_rejected_until_first_completes() {
    let client = Arc::new(MockClient::new().with_applications(vec![app(1, "nas")]));
    let gate = client.gate_applications();
    let (scheduler, mut outcomes) = Scheduler::new();

    let first = scheduler.submit(GetApplications::new(client.clone())).unwrap();
    let second = scheduler.submit(GetApplications::new(client.clone()));

    match second {
        Err(SubmitError::AlreadyRunning { key }) => assert_eq!(&key, first.key()),
        Ok(_) => panic!("duplicate task admitted"),
    }
    assert!(scheduler.is_running(first.key()));

    gate.notify_one();
    let delivery = outcomes.recv().await.unwrap();
    assert_eq!(delivery.id, first.id());
    assert_eq!(delivery.signal, TaskSignal::ApplicationsLoaded(vec![app(1, "nas")]));
    assert!(!scheduler.is_running(first.key()));

    let again = scheduler.submit(GetApplications::new(client.clone()));
    assert!(again.is_ok());
}

#[tokio::test]
async fn different_targets_run_side_by_side() {
    let client = Arc::new(MockClient::new());
    let (scheduler, mut outcomes) = Scheduler::new();

    scheduler.submit(GetMessages::new(client.clone(), 1, 10)).unwrap();
    scheduler.submit(GetMessages::new(client.clone(), 2, 10)).unwrap();

    let mut appids = Vec::new();
    for _ in 0..2 {
        match outcomes.recv().await.unwrap().signal {
            TaskSignal::MessagesLoaded { appid, .. } => appids.push(appid),
            other => panic!("unexpected signal {other:?}"),
        }
    }
    appids.sort_unstable();
    assert_eq!(appids, vec![1, 2]);
}

#[tokio::test]
async fn panicking_task_becomes_failed_signal() {
    let client = Arc::new(MockClient::new().panicking_on_applications());
    let (scheduler, mut outcomes) = Scheduler::new();

    let handle = scheduler.submit(GetApplications::new(client.clone())).unwrap();
    let delivery = outcomes.recv().await.unwrap();

    match &delivery.signal {
        TaskSignal::Failed(diagnostic) => assert!(diagnostic.contains("panicked")),
        other => panic!("unexpected signal {other:?}"),
    }
    assert_eq!(delivery.signal.outcome(), TaskOutcome::Failed);
    assert_eq!(handle.state(), TaskState::Terminated);
    assert!(!scheduler.is_running(handle.key()));

    // The scheduler keeps working after a panic.
    let client = Arc::new(MockClient::new());
    scheduler.submit(GetApplications::new(client)).unwrap();
    assert!(matches!(
        outcomes.recv().await.unwrap().signal,
        TaskSignal::ApplicationsLoaded(_)
    ));
}

struct Broken;

#[async_trait]
impl Task for Broken {
    fn key(&self) -> TaskKey {
        TaskKey::new(TaskKind::GetApplications, "broken")
    }

    async fn run(self: Box<Self>, _ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        Err(TaskError::Logic("missing application for message".into()))
    }
}

#[tokio::test]
async fn task_error_becomes_failed_signal_with_diagnostic() {
    let (scheduler, mut outcomes) = Scheduler::new();
    scheduler.submit(Broken).unwrap();

    let delivery = outcomes.recv().await.unwrap();
    assert_eq!(
        delivery.signal,
        TaskSignal::Failed("Unexpected state: missing application for message".into())
    );
    assert!(timeout(Duration::from_millis(50), outcomes.recv()).await.is_err());
}

struct WaitForCancel;

#[async_trait]
impl Task for WaitForCancel {
    fn key(&self) -> TaskKey {
        TaskKey::new(TaskKind::ServerConnectionWatchdog, "wait")
    }

    async fn run(self: Box<Self>, mut ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        ctx.cancelled().await;
        Ok(TaskSignal::Cancelled)
    }
}

#[tokio::test]
async fn cancel_all_reaches_every_task() {
    let (scheduler, mut outcomes) = Scheduler::new();
    let handle = scheduler.submit(WaitForCancel).unwrap();
    assert_eq!(scheduler.in_flight(), vec![handle.key().clone()]);

    scheduler.cancel_all();

    let delivery = outcomes.recv().await.unwrap();
    assert_eq!(delivery.signal, TaskSignal::Cancelled);
    assert!(scheduler.in_flight().is_empty());
}

#[tokio::test]
async fn cancelled_before_start_skips_remote_call() {
    let client = Arc::new(MockClient::new().with_applications(vec![app(1, "nas")]));
    let (scheduler, mut outcomes) = Scheduler::new();

    let handle = scheduler.submit(GetApplications::new(client)).unwrap();
    handle.cancel();

    assert_eq!(outcomes.recv().await.unwrap().signal, TaskSignal::Cancelled);
}
