use std::sync::{Arc, Mutex};

use serde_json::json;

use super::*;
use crate::eligibility::{EligibilityCache, Namespace};
use crate::model::{Message, MessagePosition};
use crate::persistence::MemoryStore;
use crate::utils::ManualClock;

#[derive(Default)]
struct RecordingRenderer {
    rendered: Mutex<Vec<String>>,
}

impl MessageRenderer for RecordingRenderer {
    fn render_modal(&self, message: &Message, _position: MessagePosition) {
        self.rendered
            .lock()
            .unwrap()
            .push(message.queue_id.clone().unwrap_or_default());
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl InAppEventListener for RecordingListener {
    fn message_shown(&self, message: &Message) {
        self.push(format!("shown:{}", message.message_id));
    }

    fn message_dismissed(&self, message: &Message) {
        self.push(format!("dismissed:{}", message.message_id));
    }

    fn message_error(&self, message: &Message) {
        self.push(format!("error:{}", message.message_id));
    }

    fn message_action_taken(&self, message: &Message, route: &str, action: &str, _name: &str) {
        self.push(format!("action:{}:{route}:{action}", message.message_id));
    }

    fn embed_message(&self, message: &Message, element_id: &str) {
        self.push(format!("embed:{}:{element_id}", message.message_id));
    }
}

#[derive(Default)]
struct RecordingQueue {
    fetches: Mutex<usize>,
    views: Mutex<Vec<String>>,
}

impl MessageQueue for RecordingQueue {
    fn fetch_user_messages(&self) {
        *self.fetches.lock().unwrap() += 1;
    }

    fn log_view(&self, message: &Message) {
        self.views
            .lock()
            .unwrap()
            .push(message.queue_id.clone().unwrap_or_default());
    }
}

struct Fixture {
    store: Arc<InAppMessagingStore>,
    renderer: Arc<RecordingRenderer>,
    listener: Arc<RecordingListener>,
    queue: Arc<RecordingQueue>,
}

fn fixture() -> Fixture {
    let store = InAppMessagingStore::new();
    let renderer = Arc::new(RecordingRenderer::default());
    let listener = Arc::new(RecordingListener::default());
    let queue = Arc::new(RecordingQueue::default());
    store.set_renderer(renderer.clone());
    store.set_event_listener(listener.clone());
    store.set_message_queue(queue.clone());
    store.dispatch(Action::Initialize {
        site_id: "site".to_string(),
        data_center: "us".to_string(),
    });
    Fixture {
        store,
        renderer,
        listener,
        queue,
    }
}

fn modal(queue_id: &str) -> Message {
    Message::new(format!("msg-{queue_id}")).with_queue_id(queue_id)
}

fn with_gist(queue_id: &str, gist: serde_json::Value) -> Message {
    modal(queue_id).with_properties(json!({ "gist": gist }))
}

fn active_queue_id(store: &InAppMessagingStore) -> Option<String> {
    store
        .state()
        .modal_message_state
        .active_message()
        .and_then(|m| m.queue_id.clone())
}

#[test]
fn highest_priority_message_is_loaded_first() {
    let f = fixture();
    f.store.dispatch(Action::ProcessMessageQueue(vec![
        modal("1").with_priority(2),
        modal("2").with_priority(1),
        modal("3").with_priority(3),
    ]));

    assert_eq!(active_queue_id(&f.store).as_deref(), Some("2"));
    let queued: Vec<_> = f
        .store
        .state()
        .messages_in_queue
        .iter()
        .filter_map(|m| m.queue_id.clone())
        .collect();
    assert_eq!(queued, ["2", "1", "3"]);
    assert_eq!(f.renderer.rendered.lock().unwrap().as_slice(), ["2"]);
}

#[test]
fn messages_without_priority_sort_last() {
    let f = fixture();
    f.store.dispatch(Action::ProcessMessageQueue(vec![
        modal("a"),
        modal("b").with_priority(5),
        modal("a"),
    ]));

    let state = f.store.state();
    let queued: Vec<_> = state
        .messages_in_queue
        .iter()
        .filter_map(|m| m.queue_id.as_deref())
        .collect();
    assert_eq!(queued, ["b", "a"]);
}

#[test]
fn route_change_dismisses_and_requalifies_modal() {
    let f = fixture();
    let home_only = with_gist("1", json!({ "routeRule": "home" }));
    f.store.dispatch(Action::SetPageRoute("home".to_string()));
    f.store.dispatch(Action::ProcessMessageQueue(vec![home_only.clone()]));
    assert_eq!(active_queue_id(&f.store).as_deref(), Some("1"));

    f.store.dispatch(Action::SetPageRoute("profile".to_string()));
    let state = f.store.state();
    assert_eq!(
        state.modal_message_state,
        ModalMessageState::Dismissed(home_only.clone())
    );
    assert!(state.shown_message_queue_ids.is_empty());
    assert!(f.listener.events().contains(&"dismissed:msg-1".to_string()));

    f.store.dispatch(Action::SetPageRoute("home".to_string()));
    assert_eq!(
        f.store.state().modal_message_state,
        ModalMessageState::Loading(home_only)
    );
    assert_eq!(f.renderer.rendered.lock().unwrap().as_slice(), ["1", "1"]);
}

#[test]
fn route_rule_must_match_the_whole_route() {
    let f = fixture();
    f.store.dispatch(Action::SetPageRoute("homepage".to_string()));
    f.store.dispatch(Action::ProcessMessageQueue(vec![with_gist(
        "1",
        json!({ "routeRule": "home" }),
    )]));
    assert_eq!(active_queue_id(&f.store), None);
}

#[test]
fn displayed_message_is_not_queued_again() {
    let f = fixture();
    let message = modal("1");
    f.store.dispatch(Action::ProcessMessageQueue(vec![message.clone()]));
    f.store.dispatch(Action::DisplayMessage(message.clone()));

    let state = f.store.state();
    assert!(state.shown_message_queue_ids.contains("1"));
    assert!(state.messages_in_queue.is_empty());
    assert_eq!(f.queue.views.lock().unwrap().as_slice(), ["1"]);

    f.store.dispatch(Action::dismiss(message.clone()));
    f.store.dispatch(Action::ProcessMessageQueue(vec![message.clone()]));

    let state = f.store.state();
    assert!(state.messages_in_queue.is_empty());
    assert_eq!(state.modal_message_state, ModalMessageState::Dismissed(message));
    assert_eq!(
        f.listener.events(),
        ["shown:msg-1", "dismissed:msg-1"]
    );
}

#[test]
fn persistent_message_marked_shown_only_on_close() {
    let f = fixture();
    let persistent = with_gist("p", json!({ "persistent": true, "routeRule": "home" }));
    f.store.dispatch(Action::SetPageRoute("home".to_string()));
    f.store.dispatch(Action::ProcessMessageQueue(vec![persistent.clone()]));
    f.store.dispatch(Action::DisplayMessage(persistent.clone()));
    assert!(f.store.state().shown_message_queue_ids.is_empty());
    assert!(f.queue.views.lock().unwrap().is_empty());

    // route change dismissal does not log
    f.store.dispatch(Action::SetPageRoute("profile".to_string()));
    assert!(f.store.state().shown_message_queue_ids.is_empty());

    f.store.dispatch(Action::SetPageRoute("home".to_string()));
    f.store.dispatch(Action::DisplayMessage(persistent.clone()));
    f.store.dispatch(Action::dismiss(persistent));

    assert!(f.store.state().shown_message_queue_ids.contains("p"));
    assert_eq!(f.queue.views.lock().unwrap().as_slice(), ["p"]);
    assert_eq!(*f.queue.fetches.lock().unwrap(), 1);
}

#[test]
fn loading_while_displayed_is_reported() {
    let f = fixture();
    let first = modal("1");
    f.store.dispatch(Action::LoadMessage(first.clone()));
    f.store.dispatch(Action::DisplayMessage(first.clone()));
    let version = f.store.state().version;

    f.store.dispatch(Action::LoadMessage(modal("2")));

    let state = f.store.state();
    assert_eq!(state.modal_message_state, ModalMessageState::Displayed(first));
    assert_eq!(state.version, version);
    assert_eq!(f.renderer.rendered.lock().unwrap().as_slice(), ["1"]);
}

#[test]
fn loading_failure_dismisses_without_marking_shown() {
    let f = fixture();
    let message = modal("1");
    f.store.dispatch(Action::LoadMessage(message.clone()));
    f.store
        .dispatch(Action::Engine(EngineAction::MessageLoadingFailed(message.clone())));

    let state = f.store.state();
    assert_eq!(state.modal_message_state, ModalMessageState::Dismissed(message));
    assert!(state.shown_message_queue_ids.is_empty());
    assert_eq!(f.listener.events(), ["error:msg-1"]);
}

#[test]
fn engine_taps_reach_the_listener() {
    let f = fixture();
    f.store.dispatch(Action::Engine(EngineAction::Tap {
        message: modal("1"),
        route: "home".to_string(),
        name: "cta".to_string(),
        action: "gist://close".to_string(),
    }));
    assert_eq!(f.listener.events(), ["action:msg-1:home:gist://close"]);
}

#[test]
fn inline_messages_are_embedded_once() {
    let f = fixture();
    let banner = with_gist("i", json!({ "elementId": "banner", "persistent": true }));
    f.store.dispatch(Action::ProcessMessageQueue(vec![banner.clone()]));

    let state = f.store.state();
    assert_eq!(
        state.queued_inline_messages_state.message("banner"),
        Some(&InlineMessageState::ReadyToEmbed(banner.clone()))
    );
    assert_eq!(active_queue_id(&f.store), None);

    f.store.dispatch(Action::DisplayMessage(banner.clone()));
    f.store.dispatch(Action::ProcessMessageQueue(vec![banner.clone()]));

    let state = f.store.state();
    assert!(
        state
            .queued_inline_messages_state
            .message("banner")
            .is_some_and(InlineMessageState::is_embedded)
    );
    assert_eq!(
        f.listener.events(),
        ["embed:msg-i:banner", "shown:msg-i"]
    );
}

#[test]
fn displaying_a_broadcast_marks_it_seen() {
    let f = fixture();
    let kv = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let broadcast = Arc::new(EligibilityCache::new(Namespace::Broadcast, kv.clone(), clock.clone()));
    let anonymous = Arc::new(EligibilityCache::new(Namespace::Anonymous, kv, clock));
    f.store.set_eligibility(broadcast.clone(), anonymous.clone());
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));

    let message = with_gist(
        "b1",
        json!({ "broadcast": { "frequency": { "count": 1, "delay": 0 } } }),
    );
    broadcast.update_from_server(std::slice::from_ref(&message));
    assert!(broadcast.is_eligible("b1"));

    f.store.dispatch(Action::DisplayMessage(message));

    assert!(!broadcast.is_eligible("b1"));
    assert!(anonymous.record("b1").is_none());
}

#[test]
fn listeners_see_increasing_versions() {
    let f = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = f.store.subscribe(move |state| sink.lock().unwrap().push(state.version));

    f.store.dispatch(Action::SetPageRoute("a".to_string()));
    f.store.dispatch(Action::SetPageRoute("a".to_string()));
    f.store.dispatch(Action::SetSseEnabled(true));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last().copied(), Some(f.store.state().version));
}

#[test]
fn panicking_listener_does_not_affect_others() {
    let f = fixture();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let _bad = f.store.subscribe(|state| {
        if state.current_route.is_some() {
            panic!("listener failure");
        }
    });
    let _good = f.store.subscribe(move |_| *counter.lock().unwrap() += 1);

    f.store.dispatch(Action::SetPageRoute("a".to_string()));
    f.store.dispatch(Action::SetPageRoute("b".to_string()));

    assert_eq!(*calls.lock().unwrap(), 3);
    assert_eq!(f.store.state().current_route.as_deref(), Some("b"));
}

#[test]
fn unsubscribed_listener_stops_receiving() {
    let f = fixture();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let subscription = f.store.subscribe(move |_| *counter.lock().unwrap() += 1);
    assert_eq!(f.store.listener_count(), 1);

    subscription.unsubscribe();
    f.store.dispatch(Action::SetPageRoute("a".to_string()));

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(f.store.listener_count(), 0);
}

#[test]
fn attribute_subscription_is_distinct_until_changed() {
    let f = fixture();
    let routes = Arc::new(Mutex::new(Vec::new()));
    let sink = routes.clone();
    let _subscription = f.store.subscribe_to_attribute(
        |state| state.current_route.clone(),
        move |route| sink.lock().unwrap().push(route.clone()),
    );

    f.store.dispatch(Action::SetPageRoute("a".to_string()));
    f.store.dispatch(Action::SetSseEnabled(true));
    f.store.dispatch(Action::SetPageRoute("a".to_string()));
    f.store.dispatch(Action::SetPageRoute("b".to_string()));

    assert_eq!(
        routes.lock().unwrap().as_slice(),
        [None, Some("a".to_string()), Some("b".to_string())]
    );
}

#[test]
fn dispatch_from_a_listener_is_applied_before_returning() {
    let f = fixture();
    let weak = Arc::downgrade(&f.store);
    let _subscription = f.store.subscribe(move |state| {
        if state.current_route.as_deref() == Some("a") {
            if let Some(store) = weak.upgrade() {
                store.dispatch(Action::SetPageRoute("b".to_string()));
            }
        }
    });

    f.store.dispatch(Action::SetPageRoute("a".to_string()));
    assert_eq!(f.store.state().current_route.as_deref(), Some("b"));
}

#[test]
fn reset_clears_session_but_keeps_site() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.store.dispatch(Action::SetSseEnabled(true));
    f.store.dispatch(Action::SetPollingInterval(30_000));
    f.store.dispatch(Action::ProcessMessageQueue(vec![modal("1")]));
    let before = f.store.state();
    assert!(before.should_use_sse());

    f.store.dispatch(Action::Reset);

    let after = f.store.state();
    assert_eq!(after.site_id, "site");
    assert_eq!(after.data_center, "us");
    assert_eq!(after.poll_interval_ms, 30_000);
    assert!(after.user_id.is_none());
    assert!(!after.sse_enabled);
    assert!(after.messages_in_queue.is_empty());
    assert_eq!(after.modal_message_state, ModalMessageState::Initial);
    assert_ne!(after.session_id, before.session_id);
    assert!(after.version > before.version);
}

#[test]
fn dismissal_reprocesses_queue_when_streaming() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.store.dispatch(Action::SetSseEnabled(true));
    let first = modal("1").with_priority(1);
    let second = modal("2").with_priority(2);
    f.store
        .dispatch(Action::ProcessMessageQueue(vec![first.clone(), second.clone()]));
    f.store.dispatch(Action::DisplayMessage(first.clone()));

    f.store.dispatch(Action::dismiss(first));

    assert_eq!(
        f.store.state().modal_message_state,
        ModalMessageState::Loading(second)
    );
}

#[test]
fn route_change_while_streaming_loads_next_modal_once() {
    let f = fixture();
    f.store.dispatch(Action::SetUserIdentifier("user-1".to_string()));
    f.store.dispatch(Action::SetSseEnabled(true));
    f.store.dispatch(Action::SetPageRoute("home".to_string()));
    let home_only = with_gist("a", json!({ "routeRule": "home" })).with_priority(1);
    let anywhere = modal("b").with_priority(2);
    f.store
        .dispatch(Action::ProcessMessageQueue(vec![home_only, anywhere.clone()]));
    assert_eq!(active_queue_id(&f.store).as_deref(), Some("a"));

    // the route dismissal and the streaming dismissal both reprocess the queue
    f.store.dispatch(Action::SetPageRoute("profile".to_string()));

    assert_eq!(
        f.store.state().modal_message_state,
        ModalMessageState::Loading(anywhere)
    );
    assert_eq!(f.renderer.rendered.lock().unwrap().as_slice(), ["a", "b"]);
}

#[test]
fn loading_while_another_modal_loads_is_reported() {
    let f = fixture();
    let first = modal("1");
    f.store.dispatch(Action::LoadMessage(first.clone()));
    let version = f.store.state().version;

    f.store.dispatch(Action::LoadMessage(modal("2")));

    let state = f.store.state();
    assert_eq!(state.modal_message_state, ModalMessageState::Loading(first));
    assert_eq!(state.version, version);
    assert_eq!(f.renderer.rendered.lock().unwrap().as_slice(), ["1"]);
}

#[test]
fn dismissed_inline_message_is_embedded_again() {
    let f = fixture();
    let banner = with_gist("i", json!({ "elementId": "banner", "persistent": true }));
    f.store.dispatch(Action::ProcessMessageQueue(vec![banner.clone()]));
    f.store.dispatch(Action::DisplayMessage(banner.clone()));
    f.store.dispatch(Action::DismissMessage {
        message: banner.clone(),
        should_log: false,
        via_close_action: false,
    });
    assert_eq!(
        f.store.state().queued_inline_messages_state.message("banner"),
        Some(&InlineMessageState::Dismissed(banner.clone()))
    );

    f.store.dispatch(Action::ProcessMessageQueue(vec![banner.clone()]));

    assert_eq!(
        f.store.state().queued_inline_messages_state.message("banner"),
        Some(&InlineMessageState::ReadyToEmbed(banner))
    );
    assert_eq!(
        f.listener.events(),
        [
            "embed:msg-i:banner",
            "shown:msg-i",
            "dismissed:msg-i",
            "embed:msg-i:banner"
        ]
    );
}

#[test]
fn concurrent_subscribers_never_see_older_snapshots() {
    let store = InAppMessagingStore::new();
    let recorded: Vec<Arc<Mutex<Vec<u64>>>> = (0..8).map(|_| Arc::default()).collect();
    let mut subscriptions = Vec::new();

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let store = &store;
            scope.spawn(move || {
                for i in 0..250 {
                    store.dispatch(Action::SetPollingInterval(worker * 1_000 + i + 1));
                }
            });
        }
        for seen in &recorded {
            let sink = Arc::clone(seen);
            subscriptions.push(store.subscribe(move |state| sink.lock().unwrap().push(state.version)));
            std::thread::yield_now();
        }
    });

    let latest = store.state().version;
    assert_eq!(latest, 1_000);
    for seen in &recorded {
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
        assert_eq!(seen.last().copied(), Some(latest));
    }
    drop(subscriptions);
}
