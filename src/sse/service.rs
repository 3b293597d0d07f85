use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::{Client, RequestBuilder};
use tokio::sync::watch;
use tracing::{debug, error, info};
use url::Url;

use super::error::{SseError, TransportFault, classify_sse_error};
use super::parser::{SseFrame, SseFrameDecoder};
use crate::config::{SiteSettings, SseSettings};
use crate::queue::http::{DATACENTER_HEADER, SITE_ID_HEADER};
use crate::utils::Result;

pub const SESSION_ID_PARAM: &str = "session_id";
pub const SITE_ID_PARAM: &str = "site_id";
pub const USER_TOKEN_PARAM: &str = "user_token";

/// What a live stream reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened,
    Server { event_type: String, data: String },
    Failed(SseError),
    Closed,
}

/// Opens realtime streams. The transport never retries on its own.
pub trait StreamTransport: Send + Sync {
    /// Exactly one live stream per call. Dropping the stream closes the
    /// connection.
    fn connect(&self, session_id: &str, user_token: &str, site_id: &str)
    -> BoxStream<'static, StreamEvent>;

    /// Ends every stream opened so far.
    fn disconnect(&self);
}

/// `text/event-stream` over reqwest.
pub struct HttpSseTransport {
    client: Client,
    endpoint: Url,
    data_center: String,
    shutdown: watch::Sender<u64>,
}

impl HttpSseTransport {
    pub fn new(settings: &SseSettings, site: &SiteSettings) -> Result<Self> {
        let client = Client::builder()
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;
        let endpoint = Url::parse(&settings.endpoint)?;
        let (shutdown, _) = watch::channel(0);
        Ok(Self {
            client,
            endpoint,
            data_center: site.data_center.clone(),
            shutdown,
        })
    }

    fn stream_url(&self, session_id: &str, user_token: &str, site_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(SESSION_ID_PARAM, session_id)
            .append_pair(SITE_ID_PARAM, site_id)
            .append_pair(USER_TOKEN_PARAM, &STANDARD.encode(user_token));
        url
    }
}

enum Phase {
    Pending(RequestBuilder),
    Open(BoxStream<'static, reqwest::Result<Vec<u8>>>),
    Finished,
}

struct StreamState {
    phase: Phase,
    decoder: SseFrameDecoder,
    pending: VecDeque<StreamEvent>,
    shutdown: watch::Receiver<u64>,
    epoch: u64,
}

impl StreamState {
    /// Resolves once `disconnect` was called after this stream was opened.
    async fn disconnected(shutdown: &mut watch::Receiver<u64>, epoch: u64) {
        loop {
            if *shutdown.borrow_and_update() != epoch {
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    fn push_frames(&mut self, chunk: &[u8]) {
        for frame in self.decoder.feed(chunk) {
            if let Some(event) = server_event(frame) {
                self.pending.push_back(event);
            }
        }
    }
}

fn server_event(frame: SseFrame) -> Option<StreamEvent> {
    let event_type = frame.event_type.unwrap_or_default();
    if event_type.trim().is_empty() || frame.data.trim().is_empty() {
        debug!(event_type, "dropping sse frame without type or data");
        return None;
    }
    debug!(event_type, data = frame.data, "received sse frame");
    Some(StreamEvent::Server {
        event_type,
        data: frame.data,
    })
}

impl StreamTransport for HttpSseTransport {
    fn connect(
        &self,
        session_id: &str,
        user_token: &str,
        site_id: &str,
    ) -> BoxStream<'static, StreamEvent> {
        let url = self.stream_url(session_id, user_token, site_id);
        debug!(endpoint = %self.endpoint, "connecting to sse endpoint");

        let request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(SITE_ID_HEADER, site_id)
            .header(DATACENTER_HEADER, &self.data_center);

        let shutdown = self.shutdown.subscribe();
        let epoch = *shutdown.borrow();
        let state = StreamState {
            phase: Phase::Pending(request),
            decoder: SseFrameDecoder::new(),
            pending: VecDeque::new(),
            shutdown,
            epoch,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }

                match std::mem::replace(&mut state.phase, Phase::Finished) {
                    Phase::Finished => return None,
                    Phase::Pending(request) => {
                        let sent = tokio::select! {
                            sent = request.send() => sent,
                            _ = StreamState::disconnected(&mut state.shutdown, state.epoch) => {
                                debug!("sse connect cancelled");
                                return None;
                            }
                        };
                        match sent {
                            Ok(response) if response.status().is_success() => {
                                info!("sse connection opened");
                                let body = response
                                    .bytes_stream()
                                    .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                                    .boxed();
                                state.phase = Phase::Open(body);
                                state.pending.push_back(StreamEvent::Opened);
                            }
                            Ok(response) => {
                                let status = response.status().as_u16();
                                error!(status, "sse connection rejected");
                                state
                                    .pending
                                    .push_back(StreamEvent::Failed(classify_sse_error(None, Some(status))));
                            }
                            Err(e) => {
                                error!(error = %e, "sse connection failed");
                                let fault = TransportFault::from_reqwest(&e);
                                let status = e.status().map(|s| s.as_u16());
                                state
                                    .pending
                                    .push_back(StreamEvent::Failed(classify_sse_error(Some(&fault), status)));
                            }
                        }
                    }
                    Phase::Open(mut body) => {
                        let next = tokio::select! {
                            next = body.next() => next,
                            _ = StreamState::disconnected(&mut state.shutdown, state.epoch) => {
                                debug!("sse stream disconnected");
                                return None;
                            }
                        };
                        match next {
                            Some(Ok(chunk)) => {
                                state.push_frames(&chunk);
                                state.phase = Phase::Open(body);
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "sse stream failed");
                                let fault = TransportFault::from_reqwest(&e);
                                state
                                    .pending
                                    .push_back(StreamEvent::Failed(classify_sse_error(Some(&fault), None)));
                            }
                            None => {
                                info!("sse connection closed");
                                state.pending.push_back(StreamEvent::Closed);
                            }
                        }
                    }
                }
            }
        })
        .boxed()
    }

    fn disconnect(&self) {
        debug!("disconnecting sse transport");
        self.shutdown.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }
}

impl std::fmt::Debug for HttpSseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSseTransport")
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}
