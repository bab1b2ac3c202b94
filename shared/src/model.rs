use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(ConversationId);
typed_id!(MessageId);
typed_id!(UserId);
typed_id!(LocalId);

impl LocalId {
    /// Provisional, client-side identifier for a draft. Never persisted as a message id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("invalid media url '{url}': {reason}")]
    InvalidMediaUrl { url: String, reason: String },

    #[error("message body has neither text nor attachment")]
    EmptyBody,
}

// --- Time ---

/// Milliseconds since the Unix epoch; the finest granularity the feed provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(ms)
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn is_after(self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// --- Location ---

/// Validated lat/lon. No remote dependency.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationRef {
    latitude: f64,
    longitude: f64,
}

impl LocationRef {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ModelError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(ModelError::InvalidCoordinate {
                lat: latitude,
                lon: longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

// --- Media ---

/// A durably addressable remote URL for an uploaded object. Never a local path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaUrl(String);

impl MediaUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, ModelError> {
        let url = url.into();
        let parsed = Url::parse(&url).map_err(|e| ModelError::InvalidMediaUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ModelError::InvalidMediaUrl {
                reason: format!("scheme '{}' is not fetchable", parsed.scheme()),
                url,
            });
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ModelError::InvalidMediaUrl {
                url,
                reason: "missing host".to_string(),
            });
        }

        Ok(Self(url))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MediaUrl {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MediaUrl> for String {
    fn from(url: MediaUrl) -> Self {
        url.0
    }
}

impl fmt::Display for MediaUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    /// Namespace of the remote key.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Audio => "audio",
        }
    }

    #[must_use]
    pub const fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Audio => "m4a",
        }
    }

    #[must_use]
    pub const fn default_content_type(self) -> &'static str {
        match self {
            Self::Image => "image/jpeg",
            Self::Audio => "audio/mp4",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => f.write_str("image"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

// --- Messages ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    Image { url: MediaUrl },
    Audio { url: MediaUrl },
    Location(LocationRef),
}

impl Attachment {
    #[must_use]
    pub fn media(kind: MediaKind, url: MediaUrl) -> Self {
        match kind {
            MediaKind::Image => Self::Image { url },
            MediaKind::Audio => Self::Audio { url },
        }
    }
}

/// Text plus at most one attachment. Media kinds are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(text: impl Into<String>, attachment: Attachment) -> Self {
        Self {
            text: text.into(),
            attachment: Some(attachment),
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.text.trim().is_empty() && self.attachment.is_none() {
            return Err(ModelError::EmptyBody);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    pub name: String,
}

impl Sender {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
        }
    }
}

/// A message as delivered by the feed. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub created_at: UnixTimeMs,
    pub sender: Sender,
    pub body: MessageBody,
}

impl Message {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.body.text
    }

    #[must_use]
    pub fn image_ref(&self) -> Option<&MediaUrl> {
        match &self.body.attachment {
            Some(Attachment::Image { url }) => Some(url),
            _ => None,
        }
    }

    #[must_use]
    pub fn audio_ref(&self) -> Option<&MediaUrl> {
        match &self.body.attachment {
            Some(Attachment::Audio { url }) => Some(url),
            _ => None,
        }
    }

    #[must_use]
    pub fn location_ref(&self) -> Option<LocationRef> {
        match &self.body.attachment {
            Some(Attachment::Location(location)) => Some(*location),
            _ => None,
        }
    }
}

/// A message payload before the feed assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub local_id: LocalId,
    pub composed_at: UnixTimeMs,
    pub sender: Sender,
    pub body: MessageBody,
}

impl MessageDraft {
    #[must_use]
    pub fn new(sender: Sender, body: MessageBody) -> Self {
        Self {
            local_id: LocalId::generate(),
            composed_at: UnixTimeMs::now(),
            sender,
            body,
        }
    }

    /// Materialize the delivered form using the feed's assigned values.
    #[must_use]
    pub fn confirm(self, confirmation: &Confirmation) -> Message {
        Message {
            id: confirmation.id.clone(),
            created_at: confirmation.created_at,
            sender: self.sender,
            body: self.body,
        }
    }
}

/// Server-assigned values for an accepted draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: MessageId,
    pub created_at: UnixTimeMs,
    pub local_id: LocalId,
}

/// Complete ordered materialization of a conversation, newest first, in feed order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    messages: Vec<Message>,
}

impl Snapshot {
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// The list handed to presentation. Replaced wholesale, never mutated.
pub type MessageList = Arc<Vec<Message>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_validation() {
        assert!(LocationRef::new(0.0, 0.0).is_ok());
        assert!(LocationRef::new(90.0, -180.0).is_ok());
        assert!(LocationRef::new(90.1, 0.0).is_err());
        assert!(LocationRef::new(0.0, 180.5).is_err());
        assert!(matches!(
            LocationRef::new(f64::NAN, 0.0),
            Err(ModelError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn test_media_url_rejects_local_paths() {
        assert!(MediaUrl::new("https://cdn.example.com/images/1_abc.jpg").is_ok());
        assert!(MediaUrl::new("file:///var/mobile/photo.jpg").is_err());
        assert!(MediaUrl::new("/tmp/recording.m4a").is_err());
        assert!(MediaUrl::new("").is_err());
    }

    #[test]
    fn test_media_url_serde_validates() {
        let ok: Result<MediaUrl, _> = serde_json::from_str("\"https://cdn.example.com/a.jpg\"");
        assert!(ok.is_ok());

        let bad: Result<MediaUrl, _> = serde_json::from_str("\"file:///a.jpg\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_body_validation() {
        assert!(MessageBody::text("hello").validate().is_ok());
        assert_eq!(MessageBody::text("   ").validate(), Err(ModelError::EmptyBody));

        let location = LocationRef::new(48.85, 2.35).unwrap();
        let body = MessageBody::with_attachment("", Attachment::Location(location));
        assert!(body.validate().is_ok());
    }

    #[test]
    fn test_media_refs_are_exclusive() {
        let url = MediaUrl::new("https://cdn.example.com/audio/1_x.m4a").unwrap();
        let message = Message {
            id: MessageId::new("m1"),
            created_at: UnixTimeMs(1_700_000_000_000),
            sender: Sender::new("u1", "Ada"),
            body: MessageBody::with_attachment("Audio message", Attachment::media(MediaKind::Audio, url.clone())),
        };

        assert_eq!(message.audio_ref(), Some(&url));
        assert!(message.image_ref().is_none());
        assert!(message.location_ref().is_none());
    }

    #[test]
    fn test_confirm_uses_server_values() {
        let draft = MessageDraft::new(Sender::new("u1", "Ada"), MessageBody::text("hi"));
        let confirmation = Confirmation {
            id: MessageId::new("server-7"),
            created_at: UnixTimeMs(42),
            local_id: draft.local_id.clone(),
        };

        let message = draft.confirm(&confirmation);
        assert_eq!(message.id.as_str(), "server-7");
        assert_eq!(message.created_at, UnixTimeMs(42));
        assert_eq!(message.text(), "hi");
    }

    #[test]
    fn test_message_json_roundtrip_keeps_timestamp() {
        let message = Message {
            id: MessageId::new("m1"),
            created_at: UnixTimeMs(1_700_000_123_456),
            sender: Sender::new("u1", "Ada"),
            body: MessageBody::text("hi"),
        };

        let json = serde_json::to_string(&message).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }
}
