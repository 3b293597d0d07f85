use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Handle;

use super::*;
use crate::config::QueueSettings;
use crate::eligibility::{EligibilityCache, Namespace};
use crate::model::{InboxMessage, Message};
use crate::persistence::MemoryStore;
use crate::store::{Action, InAppMessagingStore, MessageQueue};
use crate::utils::ManualClock;

struct Fixture {
    store: Arc<InAppMessagingStore>,
    broadcast: Arc<EligibilityCache>,
    anonymous: Arc<EligibilityCache>,
    intake: Arc<MessageIntake>,
}

fn fixture() -> Fixture {
    let store = InAppMessagingStore::new();
    store.dispatch(Action::Initialize {
        site_id: "site".to_string(),
        data_center: "us".to_string(),
    });
    let kv = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let broadcast = Arc::new(EligibilityCache::new(Namespace::Broadcast, kv.clone(), clock.clone()));
    let anonymous = Arc::new(EligibilityCache::new(Namespace::Anonymous, kv, clock));
    let intake = MessageIntake::new(&store, broadcast.clone(), anonymous.clone());
    Fixture {
        store,
        broadcast,
        anonymous,
        intake,
    }
}

fn regular(queue_id: &str) -> Message {
    Message::new(format!("msg-{queue_id}")).with_queue_id(queue_id)
}

fn broadcast(queue_id: &str, count: i64) -> Message {
    regular(queue_id).with_properties(json!({
        "gist": { "broadcast": { "frequency": { "count": count, "delay": 0 } } }
    }))
}

fn queued_ids(store: &InAppMessagingStore) -> Vec<String> {
    store
        .state()
        .messages_in_queue
        .iter()
        .filter_map(|m| m.queue_id.clone())
        .collect()
}

#[test]
fn identified_users_track_broadcasts() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));

    f.intake
        .handle_messages(vec![regular("r1"), broadcast("b1", 0)]);

    assert_eq!(queued_ids(&f.store), ["r1", "b1"]);
    assert!(f.broadcast.record("b1").is_some());
    assert!(f.anonymous.record("b1").is_none());
}

#[test]
fn anonymous_visitors_use_their_own_namespace() {
    let f = fixture();
    f.store
        .dispatch(Action::SetAnonymousIdentifier("anon-1".to_string()));

    f.intake.handle_messages(vec![broadcast("b1", 0)]);

    assert_eq!(queued_ids(&f.store), ["b1"]);
    assert!(f.anonymous.record("b1").is_some());
    assert!(f.broadcast.record("b1").is_none());
}

#[test]
fn broadcasts_are_dropped_without_any_token() {
    let f = fixture();
    f.intake
        .handle_messages(vec![regular("r1"), broadcast("b1", 0)]);

    assert_eq!(queued_ids(&f.store), ["r1"]);
    assert!(f.broadcast.record("b1").is_none());
    assert!(f.anonymous.record("b1").is_none());
}

#[test]
fn exhausted_broadcasts_are_not_requeued() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.intake.handle_messages(vec![broadcast("b1", 1)]);
    f.broadcast.mark_seen("b1");

    f.intake
        .handle_messages(vec![regular("r2"), broadcast("b1", 1)]);

    assert_eq!(queued_ids(&f.store), ["r2"]);
}

#[test]
fn clear_empties_the_queue() {
    let f = fixture();
    f.intake.handle_messages(vec![regular("r1")]);
    f.intake.clear();
    assert!(f.store.state().messages_in_queue.is_empty());
}

#[derive(Default)]
struct CountingQueue {
    fetches: AtomicUsize,
}

impl MessageQueue for CountingQueue {
    fn fetch_user_messages(&self) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
    }

    fn log_view(&self, _message: &Message) {}
}

#[tokio::test(start_paused = true)]
async fn polling_follows_interval_and_pauses_while_streaming() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.store.dispatch(Action::SetPollingInterval(30_000));
    let queue = Arc::new(CountingQueue::default());

    let poller = tokio::spawn(run_polling(f.store.clone(), queue.clone()));
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(queue.fetches.load(Ordering::SeqCst), 3);

    f.store.dispatch(Action::SetSseEnabled(true));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(queue.fetches.load(Ordering::SeqCst), 3);

    poller.abort();
}

#[tokio::test(start_paused = true)]
async fn polling_waits_for_a_user_token() {
    let f = fixture();
    let queue = Arc::new(CountingQueue::default());

    let poller = tokio::spawn(run_polling(f.store.clone(), queue.clone()));
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(queue.fetches.load(Ordering::SeqCst), 0);

    poller.abort();
}

/// Answers one connection per scripted response, in order, and returns the
/// raw request heads.
async fn serve(responses: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut requests = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            requests.push(String::from_utf8_lossy(&request).to_lowercase());
        }
        requests
    });
    (format!("http://{addr}"), server)
}

fn ok_json(body: &str, extra_headers: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n{extra_headers}\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn queue_client(endpoint: String, intake: Arc<MessageIntake>) -> Arc<HttpMessageQueue> {
    let settings = QueueSettings {
        endpoint,
        poll_interval_ms: 600_000,
    };
    HttpMessageQueue::new(Handle::current(), &settings, intake, Arc::new(MemoryStore::new())).unwrap()
}

#[tokio::test]
async fn fetch_applies_messages_and_polling_interval() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));

    let (endpoint, server) = serve(vec![ok_json(
        r#"[{"messageId":"welcome","queueId":"q1"}]"#,
        "X-Gist-Queue-Polling-Interval: 30\r\n",
    )])
    .await;

    let queue = queue_client(endpoint, f.intake.clone());
    queue.fetch_now().await.unwrap();

    assert_eq!(queued_ids(&f.store), ["q1"]);
    assert_eq!(f.store.state().poll_interval_ms, 30_000);

    let requests = server.await.unwrap();
    let session_id = f.store.state().session_id.to_lowercase();
    assert!(requests[0].starts_with(&format!("post /api/v3/users?sessionid={session_id} ")));
    assert!(requests[0].contains("x-gist-encoded-user-token: dxnlci0x"));
    assert!(requests[0].contains("x-cio-site-id: site"));
    assert!(requests[0].contains("x-gist-user-anonymous: false"));
}

#[tokio::test]
async fn no_content_clears_the_queue() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.intake.handle_messages(vec![regular("r1")]);
    assert_eq!(queued_ids(&f.store), ["r1"]);

    let (endpoint, _server) =
        serve(vec!["HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_string()]).await;
    let queue = queue_client(endpoint, f.intake.clone());
    queue.fetch_now().await.unwrap();

    assert!(f.store.state().messages_in_queue.is_empty());
    assert_eq!(f.store.state().poll_interval_ms, crate::store::state::DEFAULT_POLL_INTERVAL_MS);
}

#[tokio::test]
async fn not_modified_replays_the_cached_response() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));

    let (endpoint, server) = serve(vec![
        ok_json(r#"[{"messageId":"welcome","queueId":"q1"}]"#, "ETag: \"v1\"\r\n"),
        "HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string(),
    ])
    .await;
    let queue = queue_client(endpoint, f.intake.clone());

    queue.fetch_now().await.unwrap();
    assert_eq!(queued_ids(&f.store), ["q1"]);
    f.intake.clear();
    assert!(f.store.state().messages_in_queue.is_empty());

    queue.fetch_now().await.unwrap();
    assert_eq!(queued_ids(&f.store), ["q1"]);

    let requests = server.await.unwrap();
    assert!(!requests[0].contains("if-none-match"));
    assert!(requests[1].contains("if-none-match: \"v1\""));
}

#[tokio::test]
async fn not_modified_without_cache_clears_the_queue() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.intake.handle_messages(vec![regular("r1")]);

    let (endpoint, _server) =
        serve(vec!["HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string()]).await;
    let queue = queue_client(endpoint, f.intake.clone());
    queue.fetch_now().await.unwrap();

    assert!(f.store.state().messages_in_queue.is_empty());
}

#[tokio::test]
async fn oversized_polling_interval_is_ignored() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));

    let (endpoint, _server) = serve(vec![ok_json(
        "[]",
        &format!("X-Gist-Queue-Polling-Interval: {}\r\n", u64::MAX),
    )])
    .await;
    let queue = queue_client(endpoint, f.intake.clone());
    queue.fetch_now().await.unwrap();

    assert_eq!(f.store.state().poll_interval_ms, crate::store::state::DEFAULT_POLL_INTERVAL_MS);
}

#[tokio::test]
async fn inbox_changes_are_synced_to_the_server() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    let empty = "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_string();
    let (endpoint, server) = serve(vec![empty.clone(), empty]).await;
    let queue = queue_client(endpoint, f.intake.clone());
    let message = InboxMessage::new("q1", chrono::Utc::now());

    queue.log_inbox_opened(&message, true);
    queue.log_inbox_deleted(&message);

    let requests = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    let session_id = f.store.state().session_id.to_lowercase();
    let mut lines: Vec<&str> = requests.iter().filter_map(|r| r.lines().next()).collect();
    lines.sort();
    assert_eq!(
        lines,
        [
            format!("delete /api/v1/messages/q1?sessionid={session_id} http/1.1"),
            format!("patch /api/v1/messages/q1?sessionid={session_id} http/1.1"),
        ]
    );
}
