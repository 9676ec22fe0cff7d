//! Shared fixtures for the benchmarks.

use chrono::{DateTime, Duration, Utc};
use cocoschool_core::{ChannelId, DeliveryState, Event, EventBody, EventId, Payload};

/// A confirmed message created `n` seconds after the epoch.
#[must_use]
pub fn confirmed(channel: &ChannelId, n: i64) -> Event {
    Event {
        id: EventId::confirmed(format!("srv-{n}")),
        channel: channel.clone(),
        sender: Some("driver".into()),
        body: EventBody::Message(Payload::Text("On my way, five minutes out".into())),
        created_at: DateTime::<Utc>::default() + Duration::seconds(n),
        state: DeliveryState::Sent,
    }
}

/// `count` confirmed messages, oldest first.
#[must_use]
pub fn history(channel: &ChannelId, count: i64) -> Vec<Event> {
    (0..count).map(|n| confirmed(channel, n)).collect()
}
