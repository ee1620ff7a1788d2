//! Task and reconciliation core of a tray-first Gotify client.
//!
//! Background tasks talk to the Gotify server through [`RemoteClient`], the
//! [`Scheduler`] runs them with single-flight admission and hands their
//! outcomes to one consumer, and the [`ReconciliationModel`] holds the merged
//! applications and messages. [`Controller`] ties them together for a
//! presentation layer.

pub mod client;
pub mod consts;
pub mod controller;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod scheduler;
pub mod settings;
pub mod stream;
pub mod tasks;

pub use client::{ClientFactory, GotifyClient, GotifyClientFactory, RemoteClient};
pub use controller::{Controller, ControllerEvent, Input};
pub use error::{ClientError, ConfigError, ErrorKind, SubmitError, TaskError};
pub use model::{
    Application, ConnectionState, ErrorDetail, Message, MessageFilter, PagedMessages, Paging,
    Version,
};
pub use reconcile::{MergeMode, ModelDelta, ReconciliationModel};
pub use scheduler::{Delivery, OutcomeReceiver, Scheduler, TaskHandle, TaskId, TaskState};
pub use settings::Settings;
pub use stream::{StreamEvent, StreamUpdate};
pub use tasks::{Task, TaskContext, TaskKey, TaskKind, TaskOutcome, TaskSignal};
