//! Remote client contract and its Gotify REST implementation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    consts::AUTH_HEADER,
    core::truncate_message,
    error::ClientError,
    model::{Application, ErrorDetail, MessageFilter, PagedMessages, Version},
    settings::{build_stream_ws_url, normalize_base_url},
    stream::{Listener, StreamUpdate},
};

/// Operations the task layer needs from the notification service.
///
/// Implementations must tolerate concurrent calls; tasks share one handle.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Base URL the client talks to. Used to key single-flight tasks.
    fn server_url(&self) -> &str;

    async fn get_applications(&self) -> Result<Vec<Application>, ClientError>;

    async fn get_messages(&self, filter: &MessageFilter) -> Result<PagedMessages, ClientError>;

    /// Bulk delete. Failures are reported as `false` and logged.
    async fn delete_messages(&self, filter: &MessageFilter) -> bool;

    async fn delete_message(&self, id: i64) -> bool;

    async fn get_version(&self) -> Result<Version, ClientError>;

    fn is_listening(&self) -> bool;

    /// Opens the live stream and returns the session whose events will
    /// follow. While a session is already running it is kept and its number
    /// returned.
    fn listen(&self, events: mpsc::UnboundedSender<StreamUpdate>) -> Result<u64, ClientError>;

    fn stop_listening(&self);
}

/// Builds clients from a URL/token pair.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, url: &str, token: &str) -> Result<Arc<dyn RemoteClient>, ClientError>;
}

pub struct GotifyClientFactory {
    timeout: Duration,
}

impl GotifyClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for GotifyClientFactory {
    fn connect(&self, url: &str, token: &str) -> Result<Arc<dyn RemoteClient>, ClientError> {
        Ok(Arc::new(GotifyClient::new(url, token, self.timeout)?))
    }
}

pub struct GotifyClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    listener: Listener,
}

#[derive(Debug, Deserialize)]
struct ApplicationWire {
    id: i64,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    image: String,
}

impl GotifyClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base_url =
            normalize_base_url(base_url).map_err(|error| ClientError::InvalidUrl(error.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ClientError::Transport(format!("Failed to build HTTP client: {error}")))?;
        Ok(Self {
            base_url,
            token: token.trim().to_string(),
            http,
            listener: Listener::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header(AUTH_HEADER, &self.token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        debug!("GET {path}");
        let response = self.request(Method::GET, path).query(query).send().await?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| ClientError::Decode(error.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        debug!("DELETE {path}");
        let response = self.request(Method::DELETE, path).send().await?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl RemoteClient for GotifyClient {
    fn server_url(&self) -> &str {
        &self.base_url
    }

    async fn get_applications(&self) -> Result<Vec<Application>, ClientError> {
        let wire = self.get_json::<Vec<ApplicationWire>>("/application", &[]).await?;
        let mut applications = Vec::with_capacity(wire.len());
        for item in wire {
            let image = match resolve_application_image_url(&self.base_url, &item.image) {
                Ok(url) => url,
                Err(error) => {
                    debug!("application {} image ignored: {error}", item.id);
                    None
                }
            };
            applications.push(Application {
                id: item.id,
                name: item.name,
                description: item.description,
                image,
            });
        }
        Ok(applications)
    }

    async fn get_messages(&self, filter: &MessageFilter) -> Result<PagedMessages, ClientError> {
        let path = match filter.appid {
            Some(appid) => format!("/application/{appid}/message"),
            None => "/message".to_string(),
        };
        let mut query = Vec::new();
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(since) = filter.since {
            query.push(("since", since.to_string()));
        }
        self.get_json::<PagedMessages>(&path, &query).await
    }

    async fn delete_messages(&self, filter: &MessageFilter) -> bool {
        let path = match filter.appid {
            Some(appid) => format!("/application/{appid}/message"),
            None => "/message".to_string(),
        };
        match self.delete(&path).await {
            Ok(()) => true,
            Err(error) => {
                warn!("delete messages scope={} failed: {error}", filter.scope());
                false
            }
        }
    }

    async fn delete_message(&self, id: i64) -> bool {
        match self.delete(&format!("/message/{id}")).await {
            Ok(()) => true,
            Err(ClientError::Api(detail)) if detail.error_code == 404 => {
                debug!("message {id} already gone on server");
                true
            }
            Err(error) => {
                warn!("delete message id={id} failed: {error}");
                false
            }
        }
    }

    async fn get_version(&self) -> Result<Version, ClientError> {
        self.get_json::<Version>("/version", &[]).await
    }

    fn is_listening(&self) -> bool {
        self.listener.is_listening()
    }

    fn listen(&self, events: mpsc::UnboundedSender<StreamUpdate>) -> Result<u64, ClientError> {
        let ws_url = build_stream_ws_url(&self.base_url)
            .map_err(|error| ClientError::InvalidUrl(error.to_string()))?;
        Ok(self.listener.start(ws_url, self.token.clone(), events))
    }

    fn stop_listening(&self) {
        self.listener.stop();
    }
}

/// Turns a non-2xx response into `ClientError::Api`, preferring the server's
/// own error body when it parses.
async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read response body>".to_string());
    let detail = serde_json::from_str::<ErrorDetail>(&body).unwrap_or_else(|_| {
        ErrorDetail::new(
            status.canonical_reason().unwrap_or("HTTP error"),
            status.as_u16(),
            truncate_message(&body, 200),
        )
    });
    Err(ClientError::Api(detail))
}

pub fn resolve_application_image_url(
    base_url: &str,
    image_path: &str,
) -> Result<Option<String>, ClientError> {
    if image_path.trim().is_empty() {
        return Ok(None);
    }

    // Join against a trailing-slash base so sub-path deployments keep their prefix.
    let base = reqwest::Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
        .map_err(|error| ClientError::InvalidUrl(error.to_string()))?;
    let joined = base
        .join(image_path.trim_start_matches('/'))
        .map_err(|error| ClientError::InvalidUrl(error.to_string()))?;
    Ok(Some(joined.to_string()))
}
