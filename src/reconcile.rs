//! In-memory applications and messages, merged from task outcomes.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use tracing::{debug, warn};

use crate::model::{Application, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Full refresh of one application's messages.
    Replace,
    /// Incremental or live arrivals.
    Append,
}

/// What a single mutation changed, by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDelta {
    pub applications_added: Vec<i64>,
    pub applications_removed: Vec<i64>,
    pub applications_updated: Vec<i64>,
    pub messages_inserted: Vec<i64>,
    pub messages_updated: Vec<i64>,
    pub messages_removed: Vec<i64>,
}

impl ModelDelta {
    pub fn is_empty(&self) -> bool {
        self.applications_added.is_empty()
            && self.applications_removed.is_empty()
            && self.applications_updated.is_empty()
            && self.messages_inserted.is_empty()
            && self.messages_updated.is_empty()
            && self.messages_removed.is_empty()
    }
}

/// Newest first: date descending, then id descending.
pub fn message_cmp(a: &Message, b: &Message) -> Ordering {
    b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id))
}

#[derive(Debug, Default)]
pub struct ReconciliationModel {
    applications: Vec<Application>,
    messages: Vec<Message>,
    message_limit: Option<usize>,
}

impl ReconciliationModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of retained messages; the oldest are dropped first.
    pub fn with_message_limit(limit: usize) -> Self {
        Self {
            message_limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_for(&self, appid: i64) -> impl Iterator<Item = &Message> + '_ {
        self.messages.iter().filter(move |m| m.appid == appid)
    }

    pub fn message(&self, id: i64) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn lookup_application(&self, id: i64) -> Option<&Application> {
        self.applications.iter().find(|a| a.id == id)
    }

    /// Display context for a message; `None` when its application is unknown.
    pub fn application_for(&self, message: &Message) -> Option<&Application> {
        self.lookup_application(message.appid)
    }

    /// Replaces the application set. Applications missing from `applications`
    /// are removed together with their messages.
    pub fn apply_applications(&mut self, applications: Vec<Application>) -> ModelDelta {
        let mut delta = ModelDelta::default();

        let mut seen = HashSet::with_capacity(applications.len());
        let mut next = Vec::with_capacity(applications.len());
        for application in applications {
            if seen.insert(application.id) {
                next.push(application);
            } else {
                debug!("duplicate application id={} dropped", application.id);
            }
        }

        let previous: HashMap<i64, &Application> =
            self.applications.iter().map(|a| (a.id, a)).collect();
        for application in &next {
            match previous.get(&application.id) {
                None => delta.applications_added.push(application.id),
                Some(old) if *old != application => delta.applications_updated.push(application.id),
                Some(_) => {}
            }
        }
        delta.applications_removed = self
            .applications
            .iter()
            .map(|a| a.id)
            .filter(|id| !seen.contains(id))
            .collect();

        if !delta.applications_removed.is_empty() {
            let removed: HashSet<i64> = delta.applications_removed.iter().copied().collect();
            self.messages.retain(|m| {
                if removed.contains(&m.appid) {
                    delta.messages_removed.push(m.id);
                    false
                } else {
                    true
                }
            });
        }

        self.applications = next;
        delta
    }

    /// Merges messages of one application. Both modes resolve duplicate ids
    /// by replacement; `Replace` also drops this application's messages that
    /// are not in `messages`.
    pub fn apply_messages(&mut self, appid: i64, messages: Vec<Message>, mode: MergeMode) -> ModelDelta {
        let mut delta = ModelDelta::default();

        let (incoming, foreign): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(|m| m.appid == appid);
        if !foreign.is_empty() {
            warn!(
                "ignoring {} messages not belonging to app {appid}",
                foreign.len()
            );
        }

        if mode == MergeMode::Replace {
            let keep: HashSet<i64> = incoming.iter().map(|m| m.id).collect();
            self.messages.retain(|m| {
                if m.appid == appid && !keep.contains(&m.id) {
                    delta.messages_removed.push(m.id);
                    false
                } else {
                    true
                }
            });
        }

        for message in incoming {
            self.upsert(message, &mut delta);
        }
        self.messages.sort_by(message_cmp);
        self.enforce_limit(&mut delta);
        delta
    }

    /// Live push of a single message.
    pub fn insert_message(&mut self, message: Message) -> ModelDelta {
        let appid = message.appid;
        self.apply_messages(appid, vec![message], MergeMode::Append)
    }

    pub fn remove_message(&mut self, id: i64) -> ModelDelta {
        let mut delta = ModelDelta::default();
        if let Some(pos) = self.messages.iter().position(|m| m.id == id) {
            self.messages.remove(pos);
            delta.messages_removed.push(id);
        }
        delta
    }

    /// Removes every message, or only those of `appid`.
    pub fn remove_all_messages(&mut self, appid: Option<i64>) -> ModelDelta {
        let mut delta = ModelDelta::default();
        self.messages.retain(|m| {
            if appid.map_or(true, |appid| m.appid == appid) {
                delta.messages_removed.push(m.id);
                false
            } else {
                true
            }
        });
        delta
    }

    fn upsert(&mut self, message: Message, delta: &mut ModelDelta) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                if *existing != message {
                    delta.messages_updated.push(message.id);
                }
                *existing = message;
            }
            None => {
                if !delta.messages_inserted.contains(&message.id) {
                    delta.messages_inserted.push(message.id);
                }
                self.messages.push(message);
            }
        }
    }

    fn enforce_limit(&mut self, delta: &mut ModelDelta) {
        let Some(limit) = self.message_limit else {
            return;
        };
        if self.messages.len() <= limit {
            return;
        }
        for dropped in self.messages.drain(limit..) {
            delta.messages_updated.retain(|id| *id != dropped.id);
            if let Some(pos) = delta.messages_inserted.iter().position(|id| *id == dropped.id) {
                delta.messages_inserted.remove(pos);
            } else {
                delta.messages_removed.push(dropped.id);
            }
        }
    }
}
