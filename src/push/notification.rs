//! Wire data model for notification pokes.
//!
//! A poke carries one `Notification` with a list of target `Device`s; each
//! device routes to a pushkin via its `app_id` and addresses a provider
//! registration via its `pushkey`.

use serde::Deserialize;

/// Request body of `POST /_matrix/push/v1/notify`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyRequest {
    /// The notification to fan out.
    pub notification: Notification,
}

/// Notification priority as supplied by the home server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    /// Deliver immediately, waking the device if needed.
    #[default]
    High,
    /// Deliver opportunistically.
    Low,
}

impl NotificationPriority {
    /// Returns `true` for high priority.
    #[must_use]
    pub fn is_high(self) -> bool {
        matches!(self, Self::High)
    }
}

/// Unread counts attached to a notification.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Counts {
    /// Number of unread messages.
    pub unread: Option<i64>,
    /// Number of unanswered calls.
    pub missed_calls: Option<i64>,
}

/// Per-device display tweaks set by the caller's push rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tweaks {
    /// Sound to play; `"default"` selects the platform default.
    pub sound: Option<String>,
    /// Whether the event should be highlighted.
    pub highlight: Option<bool>,
}

/// One destination device within a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    /// Routing key selecting the pushkin.
    pub app_id: String,

    /// Provider-specific registration token (or endpoint URL for Web Push).
    pub pushkey: String,

    /// Seconds-epoch timestamp of when the pushkey was registered.
    #[serde(default)]
    pub pushkey_ts: Option<i64>,

    /// Provider-specific per-device configuration, opaque to the dispatcher.
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    /// Display tweaks from the caller's push rules.
    #[serde(default)]
    pub tweaks: Option<Tweaks>,
}

impl Device {
    /// Looks up a string field in the per-device `data` object.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    /// Whether this device opted into the identifiers-only payload format.
    #[must_use]
    pub fn event_id_only(&self) -> bool {
        self.data_str("format") == Some("event_id_only")
    }

    /// Whether the event should be highlighted on this device.
    #[must_use]
    pub fn highlight(&self) -> bool {
        self.tweaks
            .as_ref()
            .and_then(|t| t.highlight)
            .unwrap_or(false)
    }

    /// The sound tweak, if any.
    #[must_use]
    pub fn sound(&self) -> Option<&str> {
        self.tweaks.as_ref()?.sound.as_deref()
    }
}

/// A notification poke from the home server.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    /// Event being notified about.
    #[serde(default)]
    pub event_id: Option<String>,

    /// Room the event occurred in.
    #[serde(default)]
    pub room_id: Option<String>,

    /// Event type, e.g. `m.room.message`.
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,

    /// User id of the event sender.
    #[serde(default)]
    pub sender: Option<String>,

    /// Display name of the event sender.
    #[serde(default)]
    pub sender_display_name: Option<String>,

    /// Name of the room.
    #[serde(default)]
    pub room_name: Option<String>,

    /// Canonical alias of the room.
    #[serde(default)]
    pub room_alias: Option<String>,

    /// Delivery priority.
    #[serde(default)]
    pub prio: NotificationPriority,

    /// Opaque event content.
    #[serde(default)]
    pub content: Option<serde_json::Value>,

    /// Unread counts.
    #[serde(default)]
    pub counts: Option<Counts>,

    /// Destination devices; must be non-empty.
    pub devices: Vec<Device>,
}

impl Notification {
    /// The `body` field of the event content, if it is a string.
    #[must_use]
    pub fn content_body(&self) -> Option<&str> {
        self.content.as_ref()?.get("body")?.as_str()
    }

    /// Unread message count, if supplied.
    #[must_use]
    pub fn unread(&self) -> Option<i64> {
        self.counts.as_ref().and_then(|c| c.unread)
    }

    /// Missed call count, if supplied.
    #[must_use]
    pub fn missed_calls(&self) -> Option<i64> {
        self.counts.as_ref().and_then(|c| c.missed_calls)
    }
}
