//! Units of background work against the remote client.
//!
//! Each task performs one call (or a bounded sequence of calls) and reports
//! exactly one [`TaskSignal`]. Tasks never retry and never touch the
//! reconciliation model; the consumer reacts to the signal instead.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    client::{ClientFactory, RemoteClient},
    consts::MAX_API_PAGE_LIMIT,
    error::TaskError,
    model::{Application, ErrorDetail, Message, MessageFilter, Version},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    DeleteAllMessages,
    DeleteMessage,
    GetApplications,
    GetMessages,
    VerifyServerInfo,
    ServerConnectionWatchdog,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteAllMessages => "delete_all_messages",
            Self::DeleteMessage => "delete_message",
            Self::GetApplications => "get_applications",
            Self::GetMessages => "get_messages",
            Self::VerifyServerInfo => "verify_server_info",
            Self::ServerConnectionWatchdog => "server_connection_watchdog",
        }
    }
}

/// Single-flight key: at most one task per key is in flight.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub target: String,
}

impl TaskKey {
    pub fn new(kind: TaskKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind.as_str(), self.target)
    }
}

/// Terminal signal of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSignal {
    Deleted { appid: Option<i64>, success: bool },
    MessageDeleted { id: i64, success: bool },
    ApplicationsLoaded(Vec<Application>),
    ApplicationsError(ErrorDetail),
    MessagesLoaded { appid: i64, messages: Vec<Message> },
    MessagesError { appid: i64, detail: ErrorDetail },
    ServerVerified(Version),
    IncorrectToken(Version),
    IncorrectUrl,
    Closed,
    Cancelled,
    /// The task raised an unexpected condition; carries the diagnostic.
    Failed(String),
}

/// Classification of a terminal signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    AuthError,
    NetworkError,
    Cancelled,
    Failed,
}

impl TaskSignal {
    pub fn outcome(&self) -> TaskOutcome {
        match self {
            Self::Deleted { success: true, .. }
            | Self::MessageDeleted { success: true, .. }
            | Self::ApplicationsLoaded(_)
            | Self::MessagesLoaded { .. }
            | Self::ServerVerified(_) => TaskOutcome::Success,
            Self::ApplicationsError(detail) | Self::MessagesError { detail, .. }
                if detail.is_unauthorized() =>
            {
                TaskOutcome::AuthError
            }
            Self::IncorrectToken(_) => TaskOutcome::AuthError,
            Self::Deleted { success: false, .. }
            | Self::MessageDeleted { success: false, .. }
            | Self::ApplicationsError(_)
            | Self::MessagesError { .. }
            | Self::IncorrectUrl
            | Self::Closed => TaskOutcome::NetworkError,
            Self::Cancelled => TaskOutcome::Cancelled,
            Self::Failed(_) => TaskOutcome::Failed,
        }
    }
}

/// Cooperative cancellation flag handed to every running task.
#[derive(Clone)]
pub struct TaskContext {
    cancel_rx: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(cancel_rx: watch::Receiver<bool>) -> Self {
        Self { cancel_rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// cancelling side goes away without requesting it.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancel_rx.borrow_and_update() {
                return;
            }
            if self.cancel_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
pub trait Task: Send + 'static {
    fn key(&self) -> TaskKey;

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<TaskSignal, TaskError>;
}

pub struct DeleteAllMessages {
    client: Arc<dyn RemoteClient>,
    filter: MessageFilter,
}

impl DeleteAllMessages {
    pub fn new(client: Arc<dyn RemoteClient>, filter: MessageFilter) -> Self {
        Self { client, filter }
    }
}

#[async_trait]
impl Task for DeleteAllMessages {
    fn key(&self) -> TaskKey {
        TaskKey::new(
            TaskKind::DeleteAllMessages,
            format!("{}|{}", self.client.server_url(), self.filter.scope()),
        )
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        if ctx.is_cancelled() {
            return Ok(TaskSignal::Cancelled);
        }
        let success = self.client.delete_messages(&self.filter).await;
        Ok(TaskSignal::Deleted {
            appid: self.filter.appid,
            success,
        })
    }
}

pub struct DeleteMessage {
    client: Arc<dyn RemoteClient>,
    id: i64,
}

impl DeleteMessage {
    pub fn new(client: Arc<dyn RemoteClient>, id: i64) -> Self {
        Self { client, id }
    }
}

#[async_trait]
impl Task for DeleteMessage {
    fn key(&self) -> TaskKey {
        TaskKey::new(
            TaskKind::DeleteMessage,
            format!("{}|message:{}", self.client.server_url(), self.id),
        )
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        if self.id <= 0 {
            return Err(TaskError::Logic(format!("Invalid message id {}", self.id)));
        }
        if ctx.is_cancelled() {
            return Ok(TaskSignal::Cancelled);
        }
        let success = self.client.delete_message(self.id).await;
        Ok(TaskSignal::MessageDeleted {
            id: self.id,
            success,
        })
    }
}

pub struct GetApplications {
    client: Arc<dyn RemoteClient>,
}

impl GetApplications {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Task for GetApplications {
    fn key(&self) -> TaskKey {
        TaskKey::new(TaskKind::GetApplications, self.client.server_url())
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        if ctx.is_cancelled() {
            return Ok(TaskSignal::Cancelled);
        }
        match self.client.get_applications().await {
            Ok(applications) => Ok(TaskSignal::ApplicationsLoaded(applications)),
            Err(error) => {
                warn!("failed to fetch applications: {error}");
                Ok(TaskSignal::ApplicationsError(error.detail()))
            }
        }
    }
}

/// Fetches up to `limit` of an application's newest messages, following the
/// server's `since` cursor across pages.
pub struct GetMessages {
    client: Arc<dyn RemoteClient>,
    appid: i64,
    limit: usize,
}

impl GetMessages {
    pub fn new(client: Arc<dyn RemoteClient>, appid: i64, limit: usize) -> Self {
        Self {
            client,
            appid,
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl Task for GetMessages {
    fn key(&self) -> TaskKey {
        TaskKey::new(
            TaskKind::GetMessages,
            format!("{}|app:{}", self.client.server_url(), self.appid),
        )
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        let mut fresh: Vec<Message> = Vec::new();
        let mut since: Option<i64> = None;

        while fresh.len() < self.limit {
            if ctx.is_cancelled() {
                return Ok(TaskSignal::Cancelled);
            }
            let page_limit = (self.limit - fresh.len()).min(MAX_API_PAGE_LIMIT);
            let mut filter = MessageFilter::for_application(self.appid).with_limit(page_limit);
            if let Some(cursor) = since {
                filter = filter.with_since(cursor);
            }

            let page = match self.client.get_messages(&filter).await {
                Ok(page) => page,
                Err(error) => {
                    warn!("failed to fetch messages for app {}: {error}", self.appid);
                    return Ok(TaskSignal::MessagesError {
                        appid: self.appid,
                        detail: error.detail(),
                    });
                }
            };

            let page_count = page.messages.len();
            // Only ids below the cursor are new; a server that ignores the
            // cursor would otherwise hand back the same page forever.
            let page: Vec<Message> = page
                .messages
                .into_iter()
                .filter(|m| since.map_or(true, |cursor| m.id < cursor))
                .collect();
            let Some(min_id) = page.iter().map(|m| m.id).min() else {
                break;
            };
            fresh.extend(page.into_iter().take(self.limit - fresh.len()));

            if page_count < page_limit {
                break;
            }
            since = Some(min_id);
        }

        debug!("fetched {} messages for app {}", fresh.len(), self.appid);
        Ok(TaskSignal::MessagesLoaded {
            appid: self.appid,
            messages: fresh,
        })
    }
}

/// Checks a URL/token pair: the version call tells a bad host apart, the
/// single-message fetch tells a bad token apart.
pub struct VerifyServerInfo {
    factory: Arc<dyn ClientFactory>,
    url: String,
    token: String,
}

impl VerifyServerInfo {
    pub fn new(factory: Arc<dyn ClientFactory>, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            factory,
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Task for VerifyServerInfo {
    fn key(&self) -> TaskKey {
        TaskKey::new(TaskKind::VerifyServerInfo, self.url.trim().trim_end_matches('/'))
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        let client = match self.factory.connect(&self.url, &self.token) {
            Ok(client) => client,
            Err(error) => {
                debug!("verify: cannot build client: {error}");
                return Ok(TaskSignal::IncorrectUrl);
            }
        };

        if ctx.is_cancelled() {
            return Ok(TaskSignal::Cancelled);
        }
        let version = match client.get_version().await {
            Ok(version) => version,
            Err(error) => {
                debug!("verify: version request failed: {error}");
                return Ok(TaskSignal::IncorrectUrl);
            }
        };

        if ctx.is_cancelled() {
            return Ok(TaskSignal::Cancelled);
        }
        match client.get_messages(&MessageFilter::all().with_limit(1)).await {
            Ok(_) => Ok(TaskSignal::ServerVerified(version)),
            Err(error) if error.is_unauthorized() => Ok(TaskSignal::IncorrectToken(version)),
            Err(error) => {
                debug!("verify: message request failed: {error}");
                Ok(TaskSignal::IncorrectUrl)
            }
        }
    }
}

/// Periodically confirms the live stream is still open. Reports `Closed`
/// once and stops; reconnecting is the consumer's job.
pub struct ServerConnectionWatchdog {
    client: Arc<dyn RemoteClient>,
    interval: Duration,
}

impl ServerConnectionWatchdog {
    pub fn new(client: Arc<dyn RemoteClient>, interval: Duration) -> Self {
        Self { client, interval }
    }
}

#[async_trait]
impl Task for ServerConnectionWatchdog {
    fn key(&self) -> TaskKey {
        TaskKey::new(TaskKind::ServerConnectionWatchdog, self.client.server_url())
    }

    async fn run(self: Box<Self>, mut ctx: TaskContext) -> Result<TaskSignal, TaskError> {
        info!("watchdog started interval={:?}", self.interval);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(TaskSignal::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
            if ctx.is_cancelled() {
                return Ok(TaskSignal::Cancelled);
            }
            if !self.client.is_listening() {
                warn!("watchdog: client is not listening");
                return Ok(TaskSignal::Closed);
            }
            debug!("watchdog: connection alive");
        }
    }
}
