use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::store::{AuthUser, Document};

/// A user account as stored in `users/{uid}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    #[serde(default)]
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_picture: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub is_phone_verified: bool,
    #[serde(default)]
    pub status: String,
    #[serde(with = "ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub online_status: bool,
    #[serde(default)]
    pub platform_used: String,
}

impl Identity {
    pub const DEFAULT_NAME: &'static str = "User";
    pub const DEFAULT_BIO: &'static str = "Available";

    /// Profile written the first time an account signs in.
    pub fn provisional(user: &AuthUser, platform: &str, now: DateTime<Utc>) -> Self {
        Identity {
            uid: user.uid.clone(),
            email: user.email.clone(),
            display_name: user
                .display_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| Self::DEFAULT_NAME.to_string()),
            profile_picture: user.photo_url.clone().unwrap_or_default(),
            bio: Self::DEFAULT_BIO.to_string(),
            phone_number: String::new(),
            is_phone_verified: false,
            status: "online".to_string(),
            last_seen: now,
            online_status: true,
            platform_used: platform.to_string(),
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        doc.decode()
    }
}

/// A chat between a fixed set of participants, stored in `chats/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(skip)]
    pub id: String,
    /// Sorted and de-duplicated at creation, never written again
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_message: String,
    #[serde(with = "ts_milliseconds")]
    pub last_message_time: DateTime<Utc>,
    #[serde(default)]
    pub unread: BTreeMap<String, u32>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut conversation: Conversation = doc.decode()?;
        conversation.id = doc.id().to_string();
        Ok(conversation)
    }

    pub fn has_participant(&self, uid: &str) -> bool {
        self.participants.iter().any(|p| p == uid)
    }

    /// Every participant except `uid`
    pub fn others(&self, uid: &str) -> Vec<String> {
        self.participants.iter().filter(|p| *p != uid).cloned().collect()
    }

    pub fn unread_for(&self, uid: &str) -> u32 {
        self.unread.get(uid).copied().unwrap_or(0)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,      // Committed to the store by the sender
    Delivered, // Observed by the receiving client
    Seen,      // Receiver has the conversation open
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Seen => "seen",
        }
    }

    /// Transitions only ever move forward.
    pub fn can_advance_to(self, target: DeliveryStatus) -> bool {
        target > self
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

impl MessageKind {
    /// Directory summary for a media message without a caption
    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::Text => "",
            MessageKind::Image => "[image]",
            MessageKind::Video => "[video]",
            MessageKind::Audio => "[audio]",
            MessageKind::Document => "[document]",
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

/// A message stored under `chats/{conversation}/messages/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub conversation_id: String,
    /// Store commit sequence; breaks timestamp ties
    #[serde(skip)]
    pub seq: u64,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "messageType", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub delivery_status: DeliveryStatus,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut message: Message = doc.decode()?;
        message.id = doc.id().to_string();
        message.seq = doc.created_seq;
        // chats/{conversation}/messages
        message.conversation_id = doc
            .path
            .collection()
            .split('/')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        Ok(message)
    }
}

/// Presentation model of one message for one viewer
#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub message: Message,
    pub outgoing: bool,
    pub time_label: String,
}

impl MessageView {
    pub fn new(message: Message, viewer: &str) -> Self {
        Self::in_zone(message, viewer, &Local)
    }

    pub fn in_zone<Tz: TimeZone>(message: Message, viewer: &str, zone: &Tz) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let time_label = format_time(message.timestamp, zone);
        MessageView {
            outgoing: message.sender_id == viewer,
            message,
            time_label,
        }
    }
}

/// 12-hour clock label such as `3:07 PM`
pub fn format_time<Tz: TimeZone>(at: DateTime<Utc>, zone: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.with_timezone(zone).format("%-I:%M %p").to_string()
}

/// One participant's typing flag, stored in `chats/{id}/typing/{uid}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    #[serde(skip)]
    pub identity_id: String,
    pub is_typing: bool,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl TypingState {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut state: TypingState = doc.decode()?;
        state.identity_id = doc.id().to_string();
        Ok(state)
    }

    /// A raised flag counts only while it is younger than the liveness window.
    pub fn is_live(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.is_typing && now - self.updated_at <= window
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMediaType {
    Image,
    Video,
}

/// A 24-hour media status, stored in `status/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(skip)]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_photo: String,
    pub media_url: String,
    pub media_type: StatusMediaType,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub viewers: Vec<String>,
}

impl StatusUpdate {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut status: StatusUpdate = doc.decode()?;
        status.id = doc.id().to_string();
        Ok(status)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Missed,
    Answered,
    Declined,
}

/// A finished call, stored in `calls/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(skip)]
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    pub status: CallOutcome,
    /// Seconds, only for answered calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut record: CallRecord = doc.decode()?;
        record.id = doc.id().to_string();
        Ok(record)
    }
}
