//! Delivery API against an in-memory live connection and a fake durable store.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cocoschool_client::{Config, DeliveryError, MessageStore, NotificationStore, Realtime, RequestError};
use cocoschool_core::{
    Change, ChannelId, DeliveryState, EventId, Notifier, NotifyError, Payload, Permission,
    SystemAlert, Update,
};
use cocoschool_protocol::{
    ChatSummary, ContentKind, Frame, NewMessageRequest, NotificationPreferences, NotificationQuery,
    TypingStatus, WireMessage, WireNotification,
};
use cocoschool_transport::{ConnectionState, MemoryConnector, MemoryPeer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeStore {
    fail_posts: AtomicBool,
    post_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
    posted: Mutex<Vec<NewMessageRequest>>,
    history: Mutex<Vec<WireMessage>>,
    fetches: Mutex<Vec<(String, u32, Option<String>)>>,
    read: Mutex<Vec<(String, Vec<String>)>>,
    notifications: Mutex<Vec<WireNotification>>,
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn post_message(&self, request: &NewMessageRequest) -> Result<WireMessage, RequestError> {
        let delay = *self.post_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(RequestError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.posted.lock().unwrap().push(request.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(WireMessage {
            id: format!("srv-{n}"),
            chat_id: request.chat_id.clone(),
            sender_id: None,
            content: request.content.clone(),
            kind: request.kind,
            timestamp: request.timestamp,
            status: None,
        })
    }

    async fn fetch_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<WireMessage>, RequestError> {
        self.fetches
            .lock()
            .unwrap()
            .push((chat_id.to_string(), limit, before.map(str::to_string)));
        Ok(self.history.lock().unwrap().clone())
    }

    async fn mark_read(&self, chat_id: &str, message_ids: &[String]) -> Result<(), RequestError> {
        self.read
            .lock()
            .unwrap()
            .push((chat_id.to_string(), message_ids.to_vec()));
        Ok(())
    }

    async fn create_chat(&self, participants: &[String], name: &str) -> Result<ChatSummary, RequestError> {
        Ok(ChatSummary {
            id: "chat-new".into(),
            name: name.to_string(),
            participants: participants.to_vec(),
        })
    }
}

#[async_trait]
impl NotificationStore for FakeStore {
    async fn fetch_notifications(
        &self,
        _query: &NotificationQuery,
    ) -> Result<Vec<WireNotification>, RequestError> {
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn mark_notifications_read(&self, _ids: &[String]) -> Result<(), RequestError> {
        Ok(())
    }

    async fn delete_notifications(&self, _ids: &[String]) -> Result<(), RequestError> {
        Ok(())
    }

    async fn update_preferences(
        &self,
        preferences: &NotificationPreferences,
    ) -> Result<NotificationPreferences, RequestError> {
        Ok(preferences.clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    shown: Mutex<Vec<SystemAlert>>,
}

impl Notifier for RecordingNotifier {
    fn permission(&self) -> Permission {
        Permission::Granted
    }

    fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    fn show(&self, alert: &SystemAlert) -> Result<(), NotifyError> {
        self.shown.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct Fixture {
    realtime: Realtime,
    store: Arc<FakeStore>,
    connector: Arc<MemoryConnector>,
    notifier: Arc<RecordingNotifier>,
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

fn fixture_with(tune: impl FnOnce(&mut Config)) -> Fixture {
    let mut config = Config::default();
    config.endpoint.user_id = Some("me".into());
    config.endpoint.token = None;
    tune(&mut config);

    let store = Arc::new(FakeStore::default());
    let connector = Arc::new(MemoryConnector::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let realtime = Realtime::builder(config)
        .store(store.clone())
        .connector(connector.clone())
        .notifier(notifier.clone())
        .build()
        .unwrap();

    Fixture {
        realtime,
        store,
        connector,
        notifier,
    }
}

async fn connected(fixture: &Fixture) -> MemoryPeer {
    let peer = fixture.connector.accept();
    fixture.realtime.start();
    fixture
        .realtime
        .watch_connection()
        .wait_for(ConnectionState::is_connected)
        .await
        .unwrap();
    peer
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn chat() -> ChannelId {
    ChannelId::new("ride-42").unwrap()
}

fn wire(id: &str, minute: u32, content: &str) -> WireMessage {
    WireMessage {
        id: id.into(),
        chat_id: "ride-42".into(),
        sender_id: Some("driver".into()),
        content: content.into(),
        kind: ContentKind::Text,
        timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 8, minute, 0).unwrap(),
        status: None,
    }
}

fn recorder(realtime: &Realtime, channel: &ChannelId) -> (Arc<Mutex<Vec<Update>>>, cocoschool_core::Subscription) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let sub = realtime
        .subscribe(channel, move |u| sink.lock().unwrap().push(u.clone()))
        .unwrap();
    (updates, sub)
}

#[tokio::test(start_paused = true)]
async fn test_send_is_pending_then_confirmed_and_relayed() {
    let fixture = fixture();
    let mut peer = connected(&fixture).await;
    let channel = chat();
    let (updates, _sub) = recorder(&fixture.realtime, &channel);

    let sent = fixture.realtime.send_text(&channel, "On my way").await.unwrap();
    assert_eq!(sent.id, EventId::confirmed("srv-1"));
    assert_eq!(sent.state, DeliveryState::Sent);
    assert_eq!(sent.sender.as_deref(), Some("me"));

    {
        let updates = updates.lock().unwrap();
        let Change::Appended(pending) = &updates[0].change else {
            panic!("expected append, got {:?}", updates[0].change);
        };
        assert_eq!(pending.state, DeliveryState::Pending);
        assert!(!pending.id.is_confirmed());
        assert!(matches!(
            &updates[1].change,
            Change::Reconciled { local, event } if *local == pending.id && event.id == sent.id
        ));
        assert!(updates[1].revision > updates[0].revision);
    }

    let posted = fixture.store.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].chat_id, "ride-42");
    assert_eq!(posted[0].content, "On my way");

    let Some(Frame::NewMessage(relayed)) = peer.next_sent().await.unwrap() else {
        panic!("expected relayed message");
    };
    assert_eq!(relayed.id, "srv-1");

    // The server echoes the relay back: still one event.
    peer.deliver(&Frame::NewMessage(relayed));
    settle().await;
    let events = fixture.realtime.events(&channel);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, EventId::confirmed("srv-1"));
}

#[tokio::test(start_paused = true)]
async fn test_pending_event_is_visible_while_request_is_in_flight() {
    let fixture = fixture();
    let channel = chat();
    *fixture.store.post_delay.lock().unwrap() = Some(Duration::from_millis(50));

    let send = {
        let realtime = fixture.realtime.clone();
        let channel = channel.clone();
        tokio::spawn(async move { realtime.send_text(&channel, "On my way").await })
    };

    // The store answers after 50ms; look before that.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let events = fixture.realtime.events(&channel);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, DeliveryState::Pending);
    assert!(!events[0].id.is_confirmed());
    assert!(fixture.store.posted.lock().unwrap().is_empty());

    let sent = send.await.unwrap().unwrap();
    assert_eq!(sent.id, EventId::confirmed("srv-1"));
    let events = fixture.realtime.events(&channel);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, EventId::confirmed("srv-1"));
    assert_eq!(events[0].state, DeliveryState::Sent);
}

#[tokio::test(start_paused = true)]
async fn test_send_without_connection_still_persists() {
    let fixture = fixture();
    let channel = chat();

    let sent = fixture.realtime.send(&channel, Payload::Text("hello".into())).await.unwrap();
    assert_eq!(sent.state, DeliveryState::Sent);
    assert_eq!(fixture.realtime.events(&channel).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_stays_visible_and_can_be_retried() {
    let fixture = fixture();
    let channel = chat();
    fixture.store.fail_posts.store(true, Ordering::SeqCst);

    let err = fixture.realtime.send_text(&channel, "first").await.unwrap_err();
    assert!(matches!(err, DeliveryError::RequestFailed(RequestError::Status { status: 503, .. })));
    assert!(err.is_retryable());

    let events = fixture.realtime.events(&channel);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, DeliveryState::Failed);
    let failed = events[0].id.clone();

    // A second attempt through send is a new event.
    assert!(fixture.realtime.send_text(&channel, "first").await.is_err());
    assert_eq!(fixture.realtime.events(&channel).len(), 2);

    fixture.store.fail_posts.store(false, Ordering::SeqCst);
    let retried = fixture.realtime.retry(&channel, &failed).await.unwrap();
    assert_eq!(retried.state, DeliveryState::Sent);

    let events = fixture.realtime.events(&channel);
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| e.id == retried.id));
    assert!(events.iter().all(|e| e.id != failed));

    // Only failed events can be retried.
    assert!(matches!(
        fixture.realtime.retry(&channel, &retried.id).await,
        Err(DeliveryError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_discard_removes_failed_message() {
    let fixture = fixture();
    let channel = chat();
    fixture.store.fail_posts.store(true, Ordering::SeqCst);

    assert!(fixture.realtime.send_text(&channel, "oops").await.is_err());
    let failed = fixture.realtime.events(&channel)[0].id.clone();

    fixture.realtime.discard(&channel, &failed).unwrap();
    assert!(fixture.realtime.events(&channel).is_empty());
    assert!(matches!(
        fixture.realtime.discard(&channel, &failed),
        Err(DeliveryError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_marks_failed() {
    let fixture = fixture();
    let channel = chat();
    *fixture.store.post_delay.lock().unwrap() = Some(Duration::from_secs(60));

    let err = fixture.realtime.send_text(&channel, "slow").await.unwrap_err();
    assert!(matches!(err, DeliveryError::Timeout));
    assert_eq!(fixture.realtime.events(&channel)[0].state, DeliveryState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_does_not_duplicate_events() {
    let fixture = fixture();
    let mut first = connected(&fixture).await;
    let channel = chat();
    let (_updates, _sub) = recorder(&fixture.realtime, &channel);

    first.deliver(&Frame::NewMessage(wire("m1", 1, "leaving now")));
    settle().await;
    first.close();

    let second = fixture.connector.accept();
    let mut state = fixture.realtime.watch_connection();
    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();
    state.wait_for(ConnectionState::is_connected).await.unwrap();
    assert_eq!(fixture.connector.attempts(), 2);

    second.deliver(&Frame::NewMessage(wire("m1", 1, "leaving now")));
    second.deliver(&Frame::NewMessage(wire("m2", 2, "here")));
    settle().await;

    let ids: Vec<EventId> = fixture.realtime.events(&channel).into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![EventId::confirmed("m1"), EventId::confirmed("m2")]);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_are_ordered_by_creation_time() {
    let fixture = fixture();
    let peer = connected(&fixture).await;
    let channel = chat();
    let (_updates, _sub) = recorder(&fixture.realtime, &channel);

    peer.deliver(&Frame::NewMessage(wire("late", 5, "b")));
    peer.deliver(&Frame::NewMessage(wire("early", 1, "a")));
    peer.deliver_raw("{\"type\":\"new_message\"");
    settle().await;

    let ids: Vec<EventId> = fixture.realtime.events(&channel).into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![EventId::confirmed("early"), EventId::confirmed("late")]);
    assert!(fixture.realtime.connection_state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicators() {
    let fixture = fixture();
    let peer = connected(&fixture).await;
    let channel = chat();
    let (_updates, _sub) = recorder(&fixture.realtime, &channel);

    let typing = |user: &str, is_typing: bool| {
        Frame::TypingStatus(TypingStatus {
            chat_id: "ride-42".into(),
            is_typing,
            user_id: Some(user.into()),
        })
    };

    // Our own echo is ignored.
    peer.deliver(&typing("me", true));
    peer.deliver(&typing("driver", true));
    settle().await;
    assert_eq!(fixture.realtime.typing_users(&channel), vec!["driver".to_string()]);

    // Typing is not cached as an event.
    assert!(fixture.realtime.events(&channel).is_empty());

    // Without refresh the indicator expires.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(fixture.realtime.typing_users(&channel).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_typing_debouncer_publishes_over_connection() {
    let fixture = fixture();
    let mut peer = connected(&fixture).await;
    let typing = fixture.realtime.typing_debouncer(chat());

    for _ in 0..4 {
        typing.keystroke();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let expected = |is_typing| {
        Some(Frame::TypingStatus(TypingStatus {
            chat_id: "ride-42".into(),
            is_typing,
            user_id: Some("me".into()),
        }))
    };
    assert_eq!(peer.try_next_sent(), expected(true));
    assert_eq!(peer.try_next_sent(), expected(false));
    assert_eq!(peer.try_next_sent(), None);
}

#[tokio::test(start_paused = true)]
async fn test_mark_as_read_is_durable_and_not_published() {
    let fixture = fixture();
    let mut peer = connected(&fixture).await;
    let channel = chat();
    let (_updates, _sub) = recorder(&fixture.realtime, &channel);

    peer.deliver(&Frame::NewMessage(wire("m1", 1, "a")));
    peer.deliver(&Frame::NewMessage(wire("m2", 2, "b")));
    settle().await;

    let ids = vec!["m1".to_string(), "unknown".to_string()];
    let changed = fixture.realtime.mark_as_read(&channel, &ids).await.unwrap();
    assert_eq!(changed, vec![EventId::confirmed("m1")]);

    assert_eq!(
        *fixture.store.read.lock().unwrap(),
        vec![("ride-42".to_string(), ids.clone())]
    );
    let states: Vec<DeliveryState> = fixture.realtime.events(&channel).iter().map(|e| e.state).collect();
    assert_eq!(states, vec![DeliveryState::Read, DeliveryState::Sent]);
    assert_eq!(peer.try_next_sent(), None);
}

#[tokio::test(start_paused = true)]
async fn test_load_history_pages_backwards() {
    let fixture = fixture();
    let channel = chat();
    *fixture.store.history.lock().unwrap() = vec![wire("h2", 2, "b"), wire("h1", 1, "a")];

    assert_eq!(fixture.realtime.load_history(&channel).await.unwrap(), 2);
    assert_eq!(fixture.realtime.load_history(&channel).await.unwrap(), 0);

    let fetches = fixture.store.fetches.lock().unwrap().clone();
    assert_eq!(fetches[0], ("ride-42".to_string(), 50, None));
    assert_eq!(fetches[1], ("ride-42".to_string(), 50, Some("h1".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_notifications_surface_once() {
    let fixture = fixture();
    let peer = connected(&fixture).await;

    let notification = |id: &str, read: bool| {
        Frame::Notification(WireNotification {
            id: id.into(),
            kind: "ride_accepted".into(),
            message: Some("Your ride was accepted".into()),
            sender_name: Some("Sam".into()),
            created_at: None,
            read,
        })
    };

    peer.deliver(&notification("n1", false));
    peer.deliver(&notification("n1", false));
    peer.deliver(&notification("n2", true));
    settle().await;

    let shown = fixture.notifier.shown.lock().unwrap().clone();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].tag, "n1");

    let center = fixture.realtime.notifications();
    assert_eq!(center.events().len(), 2);
    assert_eq!(center.unread_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_view_loads_and_unsubscribes_on_drop() {
    let fixture = fixture();
    let channel = chat();
    *fixture.store.history.lock().unwrap() = vec![wire("h1", 1, "a")];

    let mut view = fixture.realtime.open(channel.clone()).unwrap();
    assert!(view.loading());
    assert_eq!(fixture.realtime.hub().subscriber_count(&channel), 1);

    while view.loading() {
        assert!(view.changed().await);
    }
    assert!(view.error().is_none());
    assert_eq!(view.events().len(), 1);

    view.send_text("thanks").await.unwrap();
    assert_eq!(view.events().len(), 2);

    drop(view);
    assert_eq!(fixture.realtime.hub().subscriber_count(&channel), 0);
    assert!(!fixture.realtime.hub().channel_exists(&channel));
    assert!(fixture.realtime.events(&channel).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_traffic_for_unopened_chats_is_dropped() {
    let fixture = fixture_with(|config| config.cache.max_channels = 2);
    let peer = connected(&fixture).await;

    for n in 0..5 {
        let mut message = wire(&format!("m{n}"), 1, "hi");
        message.chat_id = format!("ride-{n}");
        peer.deliver(&Frame::NewMessage(message));
    }
    settle().await;
    assert_eq!(fixture.realtime.hub().stats().channel_count, 0);

    // Every chat can still be opened and closed in turn.
    for n in 0..5 {
        let channel = ChannelId::new(format!("ride-{n}")).unwrap();
        let view = fixture.realtime.open(channel.clone()).unwrap();
        peer.deliver(&Frame::NewMessage(WireMessage {
            chat_id: channel.to_string(),
            ..wire(&format!("live-{n}"), 2, "hello")
        }));
        settle().await;
        assert!(view
            .events()
            .iter()
            .any(|e| e.id == EventId::confirmed(format!("live-{n}"))));
        drop(view);
        assert!(!fixture.realtime.hub().channel_exists(&channel));
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_chat() {
    let fixture = fixture();
    let (channel, summary) = fixture
        .realtime
        .create_chat(&["me".to_string(), "driver".to_string()], "School run")
        .await
        .unwrap();
    assert_eq!(channel.as_str(), "chat-new");
    assert_eq!(summary.participants.len(), 2);
}
