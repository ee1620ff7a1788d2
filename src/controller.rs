//! Reference consumer of the task layer.
//!
//! The controller is the single sequencing point: task deliveries and live
//! stream events are handled one at a time on whichever task drives
//! [`Controller::run`] (or `next_input`/`handle`), and only there are the
//! reconciliation model and the connection state mutated. It also owns the
//! reconnect policy; the watchdog and the listener only report loss.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    client::{ClientFactory, RemoteClient},
    consts::{RECONNECT_BACKOFF_INITIAL_SECS, RECONNECT_BACKOFF_MAX_SECS, RECONNECT_JITTER_MAX_MS},
    core::{jitter_millis, truncate_message, unix_now_secs},
    diagnostics::{RuntimeDiagnostics, RuntimeState},
    error::SubmitError,
    model::{ConnectionState, Message, MessageFilter, Version},
    reconcile::{MergeMode, ModelDelta, ReconciliationModel},
    scheduler::{Delivery, OutcomeReceiver, Scheduler, TaskHandle},
    settings::Settings,
    stream::{StreamEvent, StreamUpdate},
    tasks::{
        DeleteAllMessages, DeleteMessage, GetApplications, GetMessages, ServerConnectionWatchdog,
        Task, TaskKey, TaskKind, TaskSignal, VerifyServerInfo,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the controller has to react to.
#[derive(Debug)]
pub enum Input {
    Delivery(Delivery),
    Stream(StreamUpdate),
    ReconnectDue,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ConnectionState(ConnectionState),
    ModelChanged(ModelDelta),
    MessageReceived(Message),
    ServerVerified(Version),
    IncorrectToken(Version),
    IncorrectUrl,
    DeleteFailed {
        appid: Option<i64>,
        message_id: Option<i64>,
    },
    RequestFailed {
        key: TaskKey,
        detail: String,
    },
    Diagnostics(RuntimeDiagnostics),
}

pub struct Controller {
    client: Arc<dyn RemoteClient>,
    factory: Arc<dyn ClientFactory>,
    scheduler: Scheduler,
    outcomes: OutcomeReceiver,
    stream_tx: mpsc::UnboundedSender<StreamUpdate>,
    stream_rx: mpsc::UnboundedReceiver<StreamUpdate>,
    /// Listener session whose events are current; anything else is stale.
    stream_session: Option<u64>,
    model: ReconciliationModel,
    runtime: RuntimeState,
    events: broadcast::Sender<ControllerEvent>,
    watchdog: Option<TaskHandle>,
    watchdog_wanted: bool,
    reconnect_at: Option<Instant>,
    watchdog_interval: Duration,
    messages_per_application: usize,
}

impl Controller {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        factory: Arc<dyn ClientFactory>,
        settings: &Settings,
    ) -> Self {
        let (scheduler, outcomes) = Scheduler::new();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            factory,
            scheduler,
            outcomes,
            stream_tx,
            stream_rx,
            stream_session: None,
            model: ReconciliationModel::with_message_limit(settings.cache_limit()),
            runtime: RuntimeState::default(),
            events,
            watchdog: None,
            watchdog_wanted: false,
            reconnect_at: None,
            watchdog_interval: settings.watchdog_interval(),
            messages_per_application: settings.messages_per_application(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn model(&self) -> &ReconciliationModel {
        &self.model
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.runtime.connection_state
    }

    pub fn diagnostics(&self) -> RuntimeDiagnostics {
        self.runtime.snapshot(self.scheduler.in_flight().len())
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// Opens the live stream and arms the watchdog.
    pub fn start(&mut self) {
        info!("starting against {}", self.client.server_url());
        self.runtime.should_run = true;
        self.runtime.last_error = None;
        self.runtime.backoff_seconds = 0;
        self.runtime.reconnect_attempts = 0;
        self.set_state(ConnectionState::Connecting);
        self.open_stream();
        self.watchdog_wanted = true;
        self.ensure_watchdog();
        self.emit_diagnostics();
    }

    pub fn stop(&mut self) {
        info!("stopping");
        self.runtime.should_run = false;
        self.reconnect_at = None;
        self.runtime.backoff_seconds = 0;
        self.watchdog = None;
        self.watchdog_wanted = false;
        self.stream_session = None;
        self.scheduler.cancel_all();
        self.client.stop_listening();
        self.set_state(ConnectionState::Inactive);
        self.emit_diagnostics();
    }

    pub fn refresh(&self) -> Result<TaskHandle, SubmitError> {
        self.scheduler
            .submit(GetApplications::new(Arc::clone(&self.client)))
    }

    pub fn refresh_messages(&self, appid: i64) -> Result<TaskHandle, SubmitError> {
        self.scheduler.submit(GetMessages::new(
            Arc::clone(&self.client),
            appid,
            self.messages_per_application,
        ))
    }

    pub fn delete_message(&self, id: i64) -> Result<TaskHandle, SubmitError> {
        self.scheduler
            .submit(DeleteMessage::new(Arc::clone(&self.client), id))
    }

    /// Deletes every message on the server, or only those of `appid`.
    pub fn delete_all_messages(&self, appid: Option<i64>) -> Result<TaskHandle, SubmitError> {
        let filter = match appid {
            Some(appid) => MessageFilter::for_application(appid),
            None => MessageFilter::all(),
        };
        self.scheduler
            .submit(DeleteAllMessages::new(Arc::clone(&self.client), filter))
    }

    pub fn verify_server(&self, url: &str, token: &str) -> Result<TaskHandle, SubmitError> {
        self.scheduler
            .submit(VerifyServerInfo::new(Arc::clone(&self.factory), url, token))
    }

    pub fn start_watchdog(&mut self) -> Result<TaskHandle, SubmitError> {
        let handle = self.scheduler.submit(ServerConnectionWatchdog::new(
            Arc::clone(&self.client),
            self.watchdog_interval,
        ))?;
        self.watchdog = Some(handle.clone());
        self.watchdog_wanted = true;
        Ok(handle)
    }

    pub fn stop_watchdog(&mut self) {
        self.watchdog_wanted = false;
        if let Some(handle) = self.watchdog.take() {
            handle.cancel();
        }
    }

    /// Waits for the next delivery, stream event or due reconnect.
    pub async fn next_input(&mut self) -> Input {
        let reconnect_at = self.reconnect_at;
        tokio::select! {
            Some(delivery) = self.outcomes.recv() => Input::Delivery(delivery),
            Some(update) = self.stream_rx.recv() => Input::Stream(update),
            _ = wait_until(reconnect_at) => Input::ReconnectDue,
        }
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Delivery(delivery) => self.handle_delivery(delivery),
            Input::Stream(update) => self.handle_stream_event(update),
            Input::ReconnectDue => self.reconnect(),
        }
        self.emit_diagnostics();
    }

    /// Starts, processes inputs until `shutdown` flips to `true`, then stops.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.start();
        loop {
            tokio::select! {
                input = self.next_input() => self.handle(input),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.stop();
    }

    pub fn handle_delivery(&mut self, delivery: Delivery) {
        let Delivery { id, key, signal } = delivery;
        debug!("delivery {key} (#{}): {:?}", id.get(), signal.outcome());
        if key.kind == TaskKind::ServerConnectionWatchdog
            && self.watchdog.as_ref().map(|h| h.id()) == Some(id)
        {
            self.watchdog = None;
        }

        match signal {
            TaskSignal::ApplicationsLoaded(applications) => {
                let appids: Vec<i64> = applications.iter().map(|a| a.id).collect();
                let delta = self.model.apply_applications(applications);
                self.publish_delta(delta);
                for appid in appids {
                    self.submit_quiet(GetMessages::new(
                        Arc::clone(&self.client),
                        appid,
                        self.messages_per_application,
                    ));
                }
            }
            TaskSignal::ApplicationsError(detail) => {
                if detail.is_unauthorized() {
                    self.set_state(ConnectionState::Error);
                }
                self.request_failed(key, detail.to_string());
            }
            TaskSignal::MessagesLoaded { appid, messages } => {
                if self.model.lookup_application(appid).is_none() {
                    debug!("dropping messages for unknown app {appid}");
                    return;
                }
                let delta = self.model.apply_messages(appid, messages, MergeMode::Replace);
                self.publish_delta(delta);
            }
            TaskSignal::MessagesError { detail, .. } => {
                self.request_failed(key, detail.to_string());
            }
            TaskSignal::Deleted { appid, success } => {
                if success {
                    let delta = self.model.remove_all_messages(appid);
                    self.publish_delta(delta);
                } else {
                    self.publish(ControllerEvent::DeleteFailed {
                        appid,
                        message_id: None,
                    });
                }
            }
            TaskSignal::MessageDeleted { id, success } => {
                if success {
                    let delta = self.model.remove_message(id);
                    self.publish_delta(delta);
                } else {
                    self.publish(ControllerEvent::DeleteFailed {
                        appid: None,
                        message_id: Some(id),
                    });
                }
            }
            TaskSignal::ServerVerified(version) => {
                self.publish(ControllerEvent::ServerVerified(version));
            }
            TaskSignal::IncorrectToken(version) => {
                self.publish(ControllerEvent::IncorrectToken(version));
            }
            TaskSignal::IncorrectUrl => self.publish(ControllerEvent::IncorrectUrl),
            TaskSignal::Closed => {
                if self.runtime.should_run {
                    self.set_state(ConnectionState::Inactive);
                    self.schedule_reconnect("watchdog found the stream closed");
                }
            }
            TaskSignal::Cancelled => {
                debug!("{key} cancelled");
                // A restart can race the previous watchdog's shutdown and lose
                // the single-flight slot; take it over once it is free.
                if key.kind == TaskKind::ServerConnectionWatchdog
                    && self.runtime.should_run
                    && self.watchdog_wanted
                {
                    self.ensure_watchdog();
                }
            }
            TaskSignal::Failed(diagnostic) => {
                self.runtime.last_error = Some(diagnostic.clone());
                self.request_failed(key, diagnostic);
            }
        }
    }

    /// Applies an event from the current listener session. Events from
    /// earlier sessions, or arriving after `stop`, are dropped.
    pub fn handle_stream_event(&mut self, update: StreamUpdate) {
        let StreamUpdate { session, event } = update;
        if self.stream_session != Some(session) {
            debug!(
                "dropping stream event from stale session {session} (current {:?})",
                self.stream_session
            );
            return;
        }
        let now = unix_now_secs();
        match event {
            StreamEvent::Opened => {
                self.runtime.last_connected_at = Some(now);
                self.runtime.mark_stream_activity(now);
                self.runtime.last_error = None;
                self.runtime.backoff_seconds = 0;
                self.reconnect_at = None;
                self.set_state(ConnectionState::Active);
                if let Err(error) = self.refresh() {
                    debug!("refresh on open skipped: {error}");
                }
                self.ensure_watchdog();
            }
            StreamEvent::Message(message) => {
                self.runtime.mark_stream_activity(now);
                self.runtime.last_message_at = Some(now);
                self.runtime.last_message_id = Some(message.id);
                debug!(
                    "message received id={} title={}",
                    message.id,
                    truncate_message(&message.title, 60)
                );
                let delta = self.model.insert_message(message.clone());
                self.publish(ControllerEvent::MessageReceived(message));
                self.publish_delta(delta);
            }
            StreamEvent::Closed(reason) => {
                self.set_state(ConnectionState::Inactive);
                if self.runtime.should_run {
                    self.schedule_reconnect(&reason);
                }
            }
            StreamEvent::Error(reason) => {
                self.runtime.last_error = Some(truncate_message(&reason, 300));
                self.set_state(ConnectionState::Error);
                if self.runtime.should_run {
                    self.schedule_reconnect(&reason);
                }
            }
        }
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        if !self.runtime.should_run {
            return;
        }
        info!(
            "reconnecting (attempt {})",
            self.runtime.reconnect_attempts
        );
        self.set_state(ConnectionState::Connecting);
        self.open_stream();
    }

    fn open_stream(&mut self) {
        match self.client.listen(self.stream_tx.clone()) {
            Ok(session) => {
                debug!("listening on stream session {session}");
                self.stream_session = Some(session);
            }
            Err(error) => {
                let reason = error.to_string();
                self.stream_session = None;
                self.runtime.last_error = Some(truncate_message(&reason, 300));
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect(&reason);
            }
        }
    }

    /// Arms one reconnect with exponential backoff. Further loss reports are
    /// ignored while one is pending.
    fn schedule_reconnect(&mut self, reason: &str) {
        if self.reconnect_at.is_some() {
            debug!("reconnect already pending ({reason})");
            return;
        }
        let backoff_secs = next_backoff_secs(self.runtime.backoff_seconds);
        self.runtime.backoff_seconds = backoff_secs;
        self.runtime.reconnect_attempts = self.runtime.reconnect_attempts.saturating_add(1);
        let delay = Duration::from_secs(backoff_secs)
            + Duration::from_millis(jitter_millis(RECONNECT_JITTER_MAX_MS));
        warn!(
            "connection lost: {}; reconnecting in {delay:?}",
            truncate_message(reason, 200)
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn ensure_watchdog(&mut self) {
        if self.watchdog.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if let Err(error) = self.start_watchdog() {
            debug!("watchdog not started: {error}");
        }
    }

    fn submit_quiet<T: Task>(&self, task: T) {
        if let Err(error) = self.scheduler.submit(task) {
            debug!("{error}");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.runtime.connection_state == state {
            return;
        }
        info!(
            "connection state {} -> {state}",
            self.runtime.connection_state
        );
        self.runtime.connection_state = state;
        self.publish(ControllerEvent::ConnectionState(state));
    }

    fn request_failed(&mut self, key: TaskKey, detail: String) {
        warn!("{key} failed: {}", truncate_message(&detail, 200));
        self.publish(ControllerEvent::RequestFailed { key, detail });
    }

    fn publish_delta(&self, delta: ModelDelta) {
        if !delta.is_empty() {
            self.publish(ControllerEvent::ModelChanged(delta));
        }
    }

    fn publish(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_diagnostics(&self) {
        self.publish(ControllerEvent::Diagnostics(self.diagnostics()));
    }
}

fn next_backoff_secs(current: u64) -> u64 {
    if current == 0 {
        RECONNECT_BACKOFF_INITIAL_SECS
    } else {
        current
            .saturating_mul(2)
            .min(RECONNECT_BACKOFF_MAX_SECS)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
