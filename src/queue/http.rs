use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::intake::MessageIntake;
use crate::config::QueueSettings;
use crate::model::{InboxMessage, Message};
use crate::persistence::KeyValueStore;
use crate::store::{Action, AppState, InAppMessagingStore, MessageQueue};
use crate::utils::{Error, Result};

pub const SITE_ID_HEADER: &str = "X-CIO-Site-Id";
pub const DATACENTER_HEADER: &str = "X-CIO-Datacenter";
pub const USER_TOKEN_HEADER: &str = "X-Gist-Encoded-User-Token";
pub const USER_ANONYMOUS_HEADER: &str = "X-Gist-User-Anonymous";
pub const POLLING_INTERVAL_HEADER: &str = "X-Gist-Queue-Polling-Interval";

/// Polls are never issued more often than this.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Persistence namespace for the last successful queue response.
pub const RESPONSE_CACHE_NAMESPACE: &str = "queue";

/// The last 200 body for a request URL, replayed on `304 Not Modified`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedResponse {
    etag: Option<String>,
    body: String,
}

struct QueueClient {
    client: Client,
    base_url: Url,
    intake: Arc<MessageIntake>,
    cache: Arc<dyn KeyValueStore>,
}

/// HTTP client for the queue API.
///
/// Every [`MessageQueue`] call spawns its request on the runtime and returns
/// at once. The last successful queue body is kept in the key-value store and
/// replayed when the server answers `304 Not Modified`.
pub struct HttpMessageQueue {
    runtime: Handle,
    inner: Arc<QueueClient>,
}

impl HttpMessageQueue {
    pub fn new(
        runtime: Handle,
        settings: &QueueSettings,
        intake: Arc<MessageIntake>,
        cache: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>> {
        let client = Client::builder().build()?;
        let base_url = Url::parse(&settings.endpoint)?;
        Ok(Arc::new(Self {
            runtime,
            inner: Arc::new(QueueClient {
                client,
                base_url,
                intake,
                cache,
            }),
        }))
    }

    fn spawn_logged<F>(&self, what: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime.spawn(async move {
            if let Err(e) = task.await {
                warn!(error = %e, what, "queue request failed");
            }
        });
    }

    /// Fetches the queue and applies the response.
    pub async fn fetch_now(&self) -> Result<()> {
        self.inner.fetch().await
    }
}

impl QueueClient {
    fn endpoint(&self, path: &str, state: &AppState) -> Result<Url> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .append_pair("sessionId", &state.session_id);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, state: &AppState) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header(SITE_ID_HEADER, &state.site_id)
            .header(DATACENTER_HEADER, &state.data_center)
            .header(USER_ANONYMOUS_HEADER, (!state.is_user_identified()).to_string())
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = state.user_token() {
            request = request.header(USER_TOKEN_HEADER, STANDARD.encode(token));
        }
        request
    }

    fn cached_response(&self, key: &str) -> Option<CachedResponse> {
        let raw = match self.cache.get(RESPONSE_CACHE_NAMESPACE, key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "failed to read cached queue response");
                return None;
            }
        };
        serde_json::from_str(&raw)
            .inspect_err(|e| warn!(error = %e, "discarding unreadable cached queue response"))
            .ok()
    }

    fn save_response(&self, key: &str, response: &CachedResponse) {
        let saved = serde_json::to_string(response)
            .map_err(Error::from)
            .and_then(|raw| self.cache.set(RESPONSE_CACHE_NAMESPACE, key, &raw));
        if let Err(e) = saved {
            warn!(error = %e, "failed to cache queue response");
        }
    }

    async fn fetch(&self) -> Result<()> {
        let Some(store) = self.intake.store() else {
            return Ok(());
        };
        let state = store.state();

        let url = self.endpoint("/api/v3/users", &state)?;
        let cache_key = url.to_string();
        let cached = self.cached_response(&cache_key);

        let mut request = self.request(Method::POST, url, &state).json(&json!({}));
        if let Some(etag) = cached.as_ref().and_then(|c| c.etag.as_deref()) {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;
        let status = response.status();
        let interval = polling_interval_ms(&response);

        match status {
            StatusCode::NOT_MODIFIED => match cached {
                Some(cached) => {
                    debug!("queue not modified, replaying cached response");
                    let messages: Vec<Message> = serde_json::from_str(&cached.body)?;
                    self.intake.handle_messages(messages);
                }
                None => {
                    debug!("queue not modified and nothing cached");
                    self.intake.clear();
                }
            },
            StatusCode::NO_CONTENT => {
                debug!("no messages for user");
                self.intake.clear();
            }
            s if s.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let body = response.text().await?;
                let messages: Vec<Message> = serde_json::from_str(&body)?;
                debug!(count = messages.len(), "fetched messages for user");
                self.save_response(&cache_key, &CachedResponse { etag, body });
                self.intake.handle_messages(messages);
            }
            s => {
                error!(status = s.as_u16(), "failed to fetch messages");
                self.intake.clear();
            }
        }

        if let Some(interval_ms) = interval {
            if interval_ms != store.state().poll_interval_ms {
                info!(interval_ms, "polling interval changed");
                store.dispatch(Action::SetPollingInterval(interval_ms));
            }
        }
        Ok(())
    }

    async fn log_view(&self, message: &Message, state: &AppState) -> Result<()> {
        let path = match &message.queue_id {
            Some(queue_id) => format!("/api/v1/logs/queue/{queue_id}"),
            None => format!("/api/v1/logs/message/{}", message.message_id),
        };
        let url = self.endpoint(&path, state)?;
        let response = self
            .request(Method::POST, url, state)
            .json(&json!({}))
            .send()
            .await?;
        debug!(status = response.status().as_u16(), path, "logged message view");
        Ok(())
    }

    async fn update_inbox(&self, method: Method, message: &InboxMessage, state: &AppState) -> Result<()> {
        let path = format!("/api/v1/messages/{}", message.queue_id);
        let url = self.endpoint(&path, state)?;
        let mut request = self.request(method.clone(), url, state);
        if method == Method::PATCH {
            request = request.json(&json!({ "opened": message.opened }));
        }
        let response = request.send().await?;
        debug!(
            status = response.status().as_u16(),
            %method,
            queue_id = %message.queue_id,
            "synced inbox message"
        );
        Ok(())
    }
}

fn polling_interval_ms(response: &Response) -> Option<u64> {
    let seconds: u64 = response
        .headers()
        .get(POLLING_INTERVAL_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    seconds.checked_mul(1000).filter(|ms| *ms > 0)
}

impl MessageQueue for HttpMessageQueue {
    fn fetch_user_messages(&self) {
        let inner = Arc::clone(&self.inner);
        self.runtime.spawn(async move {
            if let Err(e) = inner.fetch().await {
                debug!(error = %e, "error fetching messages");
            }
        });
    }

    fn log_view(&self, message: &Message) {
        let Some(store) = self.inner.intake.store() else {
            return;
        };
        let state = store.state();
        let message = message.clone();
        let inner = Arc::clone(&self.inner);
        self.spawn_logged("log view", async move { inner.log_view(&message, &state).await });
    }

    fn log_inbox_opened(&self, message: &InboxMessage, opened: bool) {
        let Some(store) = self.inner.intake.store() else {
            return;
        };
        let state = store.state();
        let message = InboxMessage {
            opened,
            ..message.clone()
        };
        let inner = Arc::clone(&self.inner);
        self.spawn_logged("update inbox message", async move {
            inner.update_inbox(Method::PATCH, &message, &state).await
        });
    }

    fn log_inbox_deleted(&self, message: &InboxMessage) {
        let Some(store) = self.inner.intake.store() else {
            return;
        };
        let state = store.state();
        let message = message.clone();
        let inner = Arc::clone(&self.inner);
        self.spawn_logged("delete inbox message", async move {
            inner.update_inbox(Method::DELETE, &message, &state).await
        });
    }
}

impl std::fmt::Debug for HttpMessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessageQueue")
            .field("base_url", &self.inner.base_url.as_str())
            .finish()
    }
}

/// Requests the queue every poll interval while the realtime stream is not
/// in use. Runs until the task is dropped.
pub async fn run_polling(store: Arc<InAppMessagingStore>, queue: Arc<dyn MessageQueue>) {
    loop {
        let state = store.state();
        if state.should_use_sse() {
            debug!("realtime stream in use, skipping poll");
        } else if state.user_token().is_none() {
            debug!("no user token, skipping poll");
        } else {
            queue.fetch_user_messages();
        }

        let interval = Duration::from_millis(state.poll_interval_ms).max(MIN_POLL_INTERVAL);
        tokio::time::sleep(interval).await;
    }
}

