//! Scripted `RemoteClient` for integration tests.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use gotify_tray::{
    Application, ClientError, ClientFactory, ErrorDetail, Message, MessageFilter, PagedMessages,
    Paging, RemoteClient, StreamEvent, StreamUpdate, Version,
};
use tokio::sync::{mpsc, Notify};

pub const SERVER: &str = "https://push.example.com";

pub fn app(id: i64, name: &str) -> Application {
    Application {
        id,
        name: name.to_string(),
        description: String::new(),
        image: None,
    }
}

pub fn msg(id: i64, appid: i64) -> Message {
    Message {
        id,
        appid,
        title: format!("title {id}"),
        message: format!("body {id}"),
        priority: 5,
        date: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        extras: None,
    }
}

pub fn version() -> Version {
    Version {
        version: "2.4.0".to_string(),
        commit: "abc123".to_string(),
        build_date: "2023-09-01".to_string(),
    }
}

pub fn unauthorized() -> ClientError {
    ClientError::Api(ErrorDetail::new(
        "Unauthorized",
        401,
        "you need to provide a valid access token or user credentials to access this api",
    ))
}

pub struct MockClient {
    url: String,
    applications: Mutex<Result<Vec<Application>, ClientError>>,
    messages: Mutex<Result<Vec<Message>, ClientError>>,
    version: Mutex<Result<Version, ClientError>>,
    delete_result: AtomicBool,
    listening_script: Mutex<VecDeque<bool>>,
    listening_default: AtomicBool,
    panic_on_applications: AtomicBool,
    ignore_cursor: AtomicBool,
    applications_gate: Mutex<Option<Arc<Notify>>>,
    pub listening_checks: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub message_requests: Mutex<Vec<MessageFilter>>,
    pub listen_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    stream_tx: Mutex<Option<mpsc::UnboundedSender<StreamUpdate>>>,
    session: AtomicU64,
    /// `listen` keeps the running session instead of opening a new one.
    session_running: AtomicBool,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            url: SERVER.to_string(),
            applications: Mutex::new(Ok(Vec::new())),
            messages: Mutex::new(Ok(Vec::new())),
            version: Mutex::new(Ok(version())),
            delete_result: AtomicBool::new(true),
            listening_script: Mutex::new(VecDeque::new()),
            listening_default: AtomicBool::new(true),
            panic_on_applications: AtomicBool::new(false),
            ignore_cursor: AtomicBool::new(false),
            applications_gate: Mutex::new(None),
            listening_checks: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            message_requests: Mutex::new(Vec::new()),
            listen_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            stream_tx: Mutex::new(None),
            session: AtomicU64::new(0),
            session_running: AtomicBool::new(false),
        }
    }

    pub fn with_applications(self, applications: Vec<Application>) -> Self {
        *self.applications.lock().unwrap() = Ok(applications);
        self
    }

    pub fn with_applications_error(self, error: ClientError) -> Self {
        *self.applications.lock().unwrap() = Err(error);
        self
    }

    pub fn with_messages(self, messages: Vec<Message>) -> Self {
        *self.messages.lock().unwrap() = Ok(messages);
        self
    }

    pub fn with_messages_error(self, error: ClientError) -> Self {
        *self.messages.lock().unwrap() = Err(error);
        self
    }

    pub fn with_version_error(self, error: ClientError) -> Self {
        *self.version.lock().unwrap() = Err(error);
        self
    }

    pub fn with_delete_result(self, success: bool) -> Self {
        self.delete_result.store(success, Ordering::SeqCst);
        self
    }

    /// `is_listening` answers from `script` first, then `default`.
    pub fn with_listening(self, script: &[bool], default: bool) -> Self {
        *self.listening_script.lock().unwrap() = script.iter().copied().collect();
        self.listening_default.store(default, Ordering::SeqCst);
        self
    }

    pub fn panicking_on_applications(self) -> Self {
        self.panic_on_applications.store(true, Ordering::SeqCst);
        self
    }

    /// `get_messages` answers every page as if no `since` was given.
    pub fn ignoring_cursor(self) -> Self {
        self.ignore_cursor.store(true, Ordering::SeqCst);
        self
    }

    /// `get_applications` waits on the returned gate before answering.
    pub fn gate_applications(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.applications_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn checks(&self) -> usize {
        self.listening_checks.load(Ordering::SeqCst)
    }

    /// Number of the most recent listener session.
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Pushes a stream event from the current session.
    pub fn push(&self, event: StreamEvent) {
        self.push_from(self.session(), event);
    }

    /// Pushes a stream event tagged with `session`, which may be an old one.
    pub fn push_from(&self, session: u64, event: StreamEvent) {
        let update = self.update_from(session, event);
        let tx = self.stream_tx.lock().unwrap();
        tx.as_ref()
            .expect("listen was not called")
            .send(update)
            .unwrap();
    }

    /// Current-session update for handing to the controller directly.
    pub fn update(&self, event: StreamEvent) -> StreamUpdate {
        self.update_from(self.session(), event)
    }

    /// Like the real listener, a terminal event of the current session ends
    /// that session before it is delivered.
    pub fn update_from(&self, session: u64, event: StreamEvent) -> StreamUpdate {
        if session == self.session()
            && matches!(event, StreamEvent::Closed(_) | StreamEvent::Error(_))
        {
            self.session_running.store(false, Ordering::SeqCst);
        }
        StreamUpdate { session, event }
    }
}

#[async_trait]
impl RemoteClient for MockClient {
    fn server_url(&self) -> &str {
        &self.url
    }

    async fn get_applications(&self) -> Result<Vec<Application>, ClientError> {
        let gate = self.applications_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.panic_on_applications.load(Ordering::SeqCst) {
            panic!("application list exploded");
        }
        self.applications.lock().unwrap().clone()
    }

    async fn get_messages(&self, filter: &MessageFilter) -> Result<PagedMessages, ClientError> {
        self.message_requests.lock().unwrap().push(*filter);
        let all = self.messages.lock().unwrap().clone()?;
        let limit = filter.limit.unwrap_or(usize::MAX);
        let since = if self.ignore_cursor.load(Ordering::SeqCst) {
            None
        } else {
            filter.since
        };
        let mut selected: Vec<Message> = all
            .into_iter()
            .filter(|m| filter.appid.map_or(true, |appid| m.appid == appid))
            .filter(|m| since.map_or(true, |since| m.id < since))
            .collect();
        selected.sort_by(|a, b| b.id.cmp(&a.id));
        selected.truncate(limit);
        Ok(PagedMessages {
            paging: Paging {
                size: selected.len(),
                since: filter.since.unwrap_or(0),
                limit: filter.limit.unwrap_or(0),
                next: None,
            },
            messages: selected,
        })
    }

    async fn delete_messages(&self, _filter: &MessageFilter) -> bool {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_result.load(Ordering::SeqCst)
    }

    async fn delete_message(&self, _id: i64) -> bool {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_result.load(Ordering::SeqCst)
    }

    async fn get_version(&self) -> Result<Version, ClientError> {
        self.version.lock().unwrap().clone()
    }

    fn is_listening(&self) -> bool {
        self.listening_checks.fetch_add(1, Ordering::SeqCst);
        self.listening_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.listening_default.load(Ordering::SeqCst))
    }

    fn listen(&self, events: mpsc::UnboundedSender<StreamUpdate>) -> Result<u64, ClientError> {
        self.listen_calls.fetch_add(1, Ordering::SeqCst);
        *self.stream_tx.lock().unwrap() = Some(events);
        if self.session_running.swap(true, Ordering::SeqCst) {
            return Ok(self.session());
        }
        Ok(self.session.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn stop_listening(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.session_running.store(false, Ordering::SeqCst);
    }
}

/// Hands out one prepared client, or fails like an unparsable URL.
pub struct MockFactory {
    client: Option<Arc<MockClient>>,
}

impl MockFactory {
    pub fn returning(client: Arc<MockClient>) -> Self {
        Self {
            client: Some(client),
        }
    }

    pub fn failing() -> Self {
        Self { client: None }
    }
}

impl ClientFactory for MockFactory {
    fn connect(&self, url: &str, _token: &str) -> Result<Arc<dyn RemoteClient>, ClientError> {
        match &self.client {
            Some(client) => Ok(Arc::clone(client) as Arc<dyn RemoteClient>),
            None => Err(ClientError::InvalidUrl(format!("cannot parse {url}"))),
        }
    }
}
